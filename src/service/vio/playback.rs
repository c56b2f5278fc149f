use std::collections::VecDeque;

use crate::service::pipeline::PlayMsg;
use crate::shared::entities::Frame;

/// Frames buffered ahead of the network clock before VIO stops pulling from TTS.
const MAX_QUEUED_FRAMES: usize = 50;

/// Utterance boundary seen in the play queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    Start {
        user_id: Option<String>,
        fname: String,
        log: bool,
    },
    End {
        user_id: Option<String>,
        fname: String,
        log: bool,
    },
}

/// What one frame period of playback produced.
#[derive(Debug, Default)]
pub struct PlayStep {
    /// Markers consumed ahead of `frame`.
    pub before: Vec<Marker>,
    pub frame: Option<Frame>,
    /// End markers directly behind `frame`.
    pub after: Vec<Marker>,
    /// Notifications whose sample boundary has now been played.
    pub due: Vec<Marker>,
}

/// Ordered play queue with sample-accurate utterance notifications.
///
/// A start notification falls due once the first sample after its marker has been played, an
/// end notification once the last sample before its marker has been played. Frames outside a
/// start/end pair are dropped.
#[derive(Debug, Default)]
pub struct PlayQueue {
    queue: VecDeque<PlayMsg>,
    queued_frames: usize,
    playing: bool,
    played_samples: u64,
    in_flight: u64,
    /// The last pending start still waits for its first frame.
    start_awaits_frame: bool,
    pending: VecDeque<(u64, Marker)>,
}

impl PlayQueue {
    pub fn wants_more(&self) -> bool {
        self.queued_frames < MAX_QUEUED_FRAMES
    }

    pub fn push(&mut self, msg: PlayMsg) {
        if matches!(msg, PlayMsg::Frame(_)) {
            self.queued_frames += 1;
        }
        self.queue.push_back(msg);
    }

    pub fn played_samples(&self) -> u64 {
        self.played_samples
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.pending.is_empty()
    }

    /// Takes the next frame to put on the network, if any.
    pub fn next(&mut self) -> PlayStep {
        let mut step = PlayStep::default();
        while let Some(msg) = self.queue.pop_front() {
            match msg {
                PlayMsg::Frame(frame) => {
                    self.queued_frames -= 1;
                    if self.playing {
                        self.in_flight = frame.len() as u64;
                        self.resolve_start();
                        step.frame = Some(frame);
                        break;
                    }
                    log::debug!("[vio] dropping frame outside an utterance");
                }
                marker => {
                    if let Some(marker) = self.mark(marker) {
                        step.before.push(marker);
                    }
                }
            }
        }
        if step.frame.is_some() {
            while matches!(self.queue.front(), Some(PlayMsg::UtteranceEnd { .. })) {
                if let Some(marker) = self.queue.pop_front().and_then(|m| self.mark(m)) {
                    step.after.push(marker);
                }
            }
        }
        step
    }

    /// Accounts for `samples` put on the network and returns the notifications now due.
    pub fn played(&mut self, samples: usize) -> Vec<Marker> {
        self.played_samples += samples as u64;
        self.in_flight = 0;
        self.take_due()
    }

    /// Drops everything queued or pending; the dropped utterances never report their end.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queued_frames;
        self.queue.clear();
        self.queued_frames = 0;
        self.pending.clear();
        self.playing = false;
        self.in_flight = 0;
        self.start_awaits_frame = false;
        dropped
    }

    fn mark(&mut self, msg: PlayMsg) -> Option<Marker> {
        match msg {
            PlayMsg::UtteranceStart {
                user_id,
                fname,
                log,
            } => {
                self.playing = true;
                let marker = Marker::Start {
                    user_id,
                    fname,
                    log,
                };
                self.pending.push_back((u64::MAX, marker.clone()));
                self.start_awaits_frame = true;
                Some(marker)
            }
            PlayMsg::UtteranceEnd {
                user_id,
                fname,
                log,
            } => {
                if !self.playing {
                    log::warn!("[vio] utterance end {} without start", fname);
                    return None;
                }
                self.playing = false;
                let marker = Marker::End {
                    user_id,
                    fname,
                    log,
                };
                // an empty utterance starts and ends at the same boundary
                self.resolve_start();
                let boundary = self.played_samples + self.in_flight;
                self.pending.push_back((boundary, marker.clone()));
                Some(marker)
            }
            PlayMsg::Frame(_) => None,
        }
    }

    fn resolve_start(&mut self) {
        if !self.start_awaits_frame {
            return;
        }
        self.start_awaits_frame = false;
        let boundary = (self.played_samples + 1).min(self.played_samples + self.in_flight);
        if let Some((pending_boundary, _)) = self.pending.back_mut() {
            *pending_boundary = boundary;
        }
    }

    fn take_due(&mut self) -> Vec<Marker> {
        let mut due = Vec::new();
        while let Some((boundary, _)) = self.pending.front() {
            if *boundary > self.played_samples {
                break;
            }
            if let Some((_, marker)) = self.pending.pop_front() {
                due.push(marker);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(fname: &str) -> PlayMsg {
        PlayMsg::UtteranceStart {
            user_id: None,
            fname: fname.to_string(),
            log: true,
        }
    }

    fn end(fname: &str) -> PlayMsg {
        PlayMsg::UtteranceEnd {
            user_id: None,
            fname: fname.to_string(),
            log: true,
        }
    }

    fn frame() -> PlayMsg {
        PlayMsg::Frame(Frame::silence(160))
    }

    fn names(markers: &[Marker]) -> Vec<String> {
        markers
            .iter()
            .map(|m| match m {
                Marker::Start { fname, .. } => format!("start:{}", fname),
                Marker::End { fname, .. } => format!("end:{}", fname),
            })
            .collect()
    }

    /// Plays one frame period the way VIO does, silence included.
    fn tick(q: &mut PlayQueue) -> (bool, Vec<String>) {
        let step = q.next();
        let sent = step.frame.is_some();
        (sent, names(&q.played(160)))
    }

    #[test]
    fn notifications_follow_played_samples() {
        let mut q = PlayQueue::default();
        for msg in [start("a"), frame(), frame(), frame(), end("a")] {
            q.push(msg);
        }
        assert_eq!(tick(&mut q), (true, vec!["start:a".to_string()]));
        assert_eq!(tick(&mut q), (true, vec![]));
        assert_eq!(tick(&mut q), (true, vec!["end:a".to_string()]));
        assert_eq!(q.played_samples(), 480);
        assert!(q.is_idle());
    }

    #[test]
    fn start_waits_for_first_frame() {
        let mut q = PlayQueue::default();
        q.push(start("a"));
        assert_eq!(tick(&mut q), (false, vec![]));
        q.push(frame());
        q.push(end("a"));
        assert_eq!(
            tick(&mut q),
            (true, vec!["start:a".to_string(), "end:a".to_string()])
        );
    }

    #[test]
    fn empty_utterance_reports_both() {
        let mut q = PlayQueue::default();
        q.push(start("a"));
        q.push(end("a"));
        let step = q.next();
        assert!(step.frame.is_none());
        assert_eq!(step.before.len(), 2);
        assert_eq!(names(&q.played(160)), vec!["start:a", "end:a"]);
    }

    #[test]
    fn frames_outside_utterances_are_dropped() {
        let mut q = PlayQueue::default();
        q.push(frame());
        q.push(frame());
        assert_eq!(tick(&mut q), (false, vec![]));
        assert!(q.is_idle());
    }

    #[test]
    fn frame_count_matches_between_markers() {
        let mut q = PlayQueue::default();
        for msg in [start("a"), frame(), frame(), end("a"), start("b"), frame(), end("b")] {
            q.push(msg);
        }
        let mut log = Vec::new();
        for _ in 0..5 {
            let (sent, events) = tick(&mut q);
            if sent {
                log.push("frame".to_string());
            }
            log.extend(events);
        }
        assert_eq!(
            log,
            vec!["frame", "start:a", "frame", "end:a", "frame", "start:b", "end:b"]
        );
    }

    #[test]
    fn clear_drops_pending_end() {
        let mut q = PlayQueue::default();
        for msg in [start("a"), frame(), frame(), frame(), end("a")] {
            q.push(msg);
        }
        assert_eq!(tick(&mut q).1, vec!["start:a".to_string()]);
        assert_eq!(q.clear(), 2);
        assert_eq!(tick(&mut q), (false, vec![]));
        assert!(q.is_idle());
        assert!(q.wants_more());
    }
}
