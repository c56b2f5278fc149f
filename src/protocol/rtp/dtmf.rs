const SAMPLE_RATE: f64 = 8000.0;
const MIN_SIGNAL_ENERGY: f64 = 1.0e6;
const MIN_TONE_FRAMES: u8 = 2;
const LOW_FREQS: [f64; 4] = [697.0, 770.0, 852.0, 941.0];
const HIGH_FREQS: [f64; 4] = [1209.0, 1336.0, 1477.0, 1633.0];
const DTMF_MAP: [[char; 4]; 4] = [
    ['1', '2', '3', 'A'],
    ['4', '5', '6', 'B'],
    ['7', '8', '9', 'C'],
    ['*', '0', '#', 'D'],
];
const EVENT_DIGITS: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', '*', '#', 'A', 'B', 'C', 'D',
];

/// In-band tone detector. A digit is reported once, after it persisted for two frames.
#[derive(Debug, Default)]
pub struct DtmfDetector {
    pending_digit: Option<char>,
    pending_count: u8,
    active_digit: Option<char>,
}

impl DtmfDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, samples: &[i16]) -> Option<char> {
        let detected = detect_digit(samples);
        if detected.is_some() && detected == self.active_digit {
            return None;
        }
        match detected {
            Some(digit) => {
                if self.pending_digit == Some(digit) {
                    self.pending_count = self.pending_count.saturating_add(1);
                } else {
                    self.pending_digit = Some(digit);
                    self.pending_count = 1;
                }
                if self.pending_count >= MIN_TONE_FRAMES {
                    self.active_digit = Some(digit);
                    self.pending_digit = None;
                    self.pending_count = 0;
                    return Some(digit);
                }
            }
            None => {
                self.pending_digit = None;
                self.pending_count = 0;
                self.active_digit = None;
            }
        }
        None
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Out-of-band `telephone-event` receiver. End packets are usually sent three times;
/// the event timestamp deduplicates them.
#[derive(Debug, Default)]
pub struct TelephoneEventReceiver {
    last_ended: Option<u32>,
}

impl TelephoneEventReceiver {
    pub fn ingest(&mut self, timestamp: u32, payload: &[u8]) -> Option<char> {
        if payload.len() < 4 {
            return None;
        }
        let end = payload[1] & 0x80 != 0;
        if !end || self.last_ended == Some(timestamp) {
            return None;
        }
        self.last_ended = Some(timestamp);
        EVENT_DIGITS.get(payload[0] as usize).copied()
    }
}

fn detect_digit(samples: &[i16]) -> Option<char> {
    if samples.len() < 80 {
        return None;
    }
    let energy: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>()
        / samples.len() as f64;
    if energy < MIN_SIGNAL_ENERGY {
        return None;
    }
    let low = LOW_FREQS.map(|f| goertzel_power(samples, f));
    let high = HIGH_FREQS.map(|f| goertzel_power(samples, f));
    let (low_idx, low_max, low_second) = max_and_second(&low);
    let (high_idx, high_max, high_second) = max_and_second(&high);
    let total: f64 = low.iter().sum::<f64>() + high.iter().sum::<f64>();
    if total <= 0.0 {
        return None;
    }
    if low_max < low_second * 2.5 || high_max < high_second * 2.5 {
        return None;
    }
    if low_max < total * 0.1 || high_max < total * 0.1 {
        return None;
    }
    Some(DTMF_MAP[low_idx][high_idx])
}

fn goertzel_power(samples: &[i16], freq: f64) -> f64 {
    let n = samples.len() as f64;
    let k = (0.5 + n * freq / SAMPLE_RATE).floor();
    let coeff = 2.0 * (2.0 * std::f64::consts::PI * k / n).cos();
    let (s1, s2) = samples.iter().fold((0.0, 0.0), |(s1, s2), &x| {
        (x as f64 + coeff * s1 - s2, s1)
    });
    s2 * s2 + s1 * s1 - coeff * s1 * s2
}

fn max_and_second(values: &[f64; 4]) -> (usize, f64, f64) {
    let mut max_idx = 0;
    let mut max_val = values[0];
    let mut second_val = 0.0;
    for (idx, &val) in values.iter().enumerate().skip(1) {
        if val > max_val {
            second_val = max_val;
            max_val = val;
            max_idx = idx;
        } else if val > second_val {
            second_val = val;
        }
    }
    (max_idx, max_val, second_val)
}
