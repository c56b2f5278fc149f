use thiserror::Error;

/// G.711 variants negotiated over SDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Pcmu,
    Pcma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unsupported RTP payload type {0}")]
pub struct UnsupportedPayload(pub u8);

impl Codec {
    pub fn from_payload_type(pt: u8) -> Result<Self, UnsupportedPayload> {
        match pt {
            0 => Ok(Self::Pcmu),
            8 => Ok(Self::Pcma),
            other => Err(UnsupportedPayload(other)),
        }
    }

    pub fn payload_type(self) -> u8 {
        match self {
            Self::Pcmu => 0,
            Self::Pcma => 8,
        }
    }

    pub fn encoding_name(self) -> &'static str {
        match self {
            Self::Pcmu => "PCMU",
            Self::Pcma => "PCMA",
        }
    }

    pub fn decode(self, payload: &[u8]) -> Vec<i16> {
        match self {
            Self::Pcmu => payload.iter().map(|&b| mulaw_to_linear16(b)).collect(),
            Self::Pcma => payload.iter().map(|&b| alaw_to_linear16(b)).collect(),
        }
    }

    pub fn encode(self, samples: &[i16]) -> Vec<u8> {
        match self {
            Self::Pcmu => samples.iter().map(|&s| linear16_to_mulaw(s)).collect(),
            Self::Pcma => samples.iter().map(|&s| linear16_to_alaw(s)).collect(),
        }
    }

    /// Encoded byte for digital silence.
    pub fn silence_byte(self) -> u8 {
        match self {
            Self::Pcmu => 0xff,
            Self::Pcma => 0xd5,
        }
    }
}

pub fn mulaw_to_linear16(mu: u8) -> i16 {
    const BIAS: i32 = 0x84;
    let mu = !mu;
    let mut t = (((mu & 0x0f) as i32) << 3) + BIAS;
    t <<= (mu & 0x70) >> 4;
    if mu & 0x80 != 0 {
        (BIAS - t) as i16
    } else {
        (t - BIAS) as i16
    }
}

pub fn linear16_to_mulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;
    let mut pcm = sample as i32;
    let sign: u8 = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(CLIP) + BIAS;
    let mut exponent = 7u8;
    while exponent > 0 && pcm & (0x80 << exponent) == 0 {
        exponent -= 1;
    }
    let mantissa = ((pcm >> (exponent + 3)) & 0x0f) as u8;
    !(sign | (exponent << 4) | mantissa)
}

pub fn alaw_to_linear16(a: u8) -> i16 {
    let a = a ^ 0x55;
    let mut t = ((a & 0x0f) as i32) << 4;
    let seg = (a & 0x70) >> 4;
    match seg {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= seg - 1;
        }
    }
    if a & 0x80 != 0 {
        t as i16
    } else {
        -t as i16
    }
}

pub fn linear16_to_alaw(sample: i16) -> u8 {
    const SEG_END: [i32; 8] = [0x1f, 0x3f, 0x7f, 0xff, 0x1ff, 0x3ff, 0x7ff, 0xfff];
    let mut pcm = (sample as i32) >> 3;
    let mask: u8 = if pcm >= 0 {
        0xd5
    } else {
        pcm = -pcm - 1;
        0x55
    };
    let Some(seg) = SEG_END.iter().position(|&end| pcm <= end) else {
        return 0x7f ^ mask;
    };
    let mantissa = if seg < 2 {
        (pcm >> 1) & 0x0f
    } else {
        (pcm >> seg) & 0x0f
    } as u8;
    (((seg as u8) << 4) | mantissa) ^ mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_encodes_to_idle_pattern() {
        assert_eq!(linear16_to_mulaw(0), Codec::Pcmu.silence_byte());
        assert_eq!(linear16_to_alaw(0), Codec::Pcma.silence_byte());
        assert_eq!(mulaw_to_linear16(0xff), 0);
        assert_eq!(alaw_to_linear16(0xd5), 8);
    }

    #[test]
    fn both_laws_track_the_input_within_quantization_error() {
        for &s in &[-32768i16, -20000, -1000, -10, 10, 1000, 12345, 32767] {
            let mu = mulaw_to_linear16(linear16_to_mulaw(s)) as i32;
            let a = alaw_to_linear16(linear16_to_alaw(s)) as i32;
            let tolerance = (s as i32).abs() / 16 + 16;
            assert!((mu - s as i32).abs() <= tolerance, "mu-law {} -> {}", s, mu);
            assert!((a - s as i32).abs() <= tolerance, "a-law {} -> {}", s, a);
            assert_eq!(mu.signum(), (s as i32).signum());
        }
    }

    #[test]
    fn payload_types() {
        assert_eq!(Codec::from_payload_type(8), Ok(Codec::Pcma));
        assert_eq!(Codec::from_payload_type(18), Err(UnsupportedPayload(18)));
    }
}
