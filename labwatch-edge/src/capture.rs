//! Synthetic capture source paced at the hub-assigned frame rate
//!
//! Produces JPEG-sized placeholder frames with a monotonic sequence number;
//! a rate of 0 pauses capture until the next directive.

use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;

pub struct SyntheticCamera {
    frame_bytes: usize,
    next_seq: u64,
}

impl SyntheticCamera {
    pub fn new(frame_bytes: usize) -> Self {
        Self { frame_bytes: frame_bytes.max(16), next_seq: 1 }
    }

    /// Trame suivante : (seq, corps)
    pub fn capture(&mut self) -> (u64, Vec<u8>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let stamp = Utc::now().timestamp_millis().to_be_bytes();
        let mut body = Vec::with_capacity(self.frame_bytes);
        body.extend_from_slice(&[0xFF, 0xD8]); // SOI
        body.extend_from_slice(&stamp);
        body.resize(self.frame_bytes - 2, (seq % 251) as u8);
        body.extend_from_slice(&[0xFF, 0xD9]); // EOI
        (seq, body)
    }
}

/// Cadence de capture ; `None` = en pause
pub struct Pacer {
    period: Option<Duration>,
    next_at: Instant,
}

impl Pacer {
    pub fn new(fps: f64) -> Self {
        Self { period: period_for(fps), next_at: Instant::now() }
    }

    pub fn set_rate(&mut self, fps: f64) {
        let period = period_for(fps);
        if period != self.period {
            self.period = period;
            // le nouveau débit s'applique dès la prochaine trame
            if let Some(p) = period {
                self.next_at = self.next_at.min(Instant::now() + p);
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.period.is_none()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.period.map(|_| self.next_at)
    }

    pub fn advance(&mut self) {
        if let Some(p) = self.period {
            let now = Instant::now();
            self.next_at = (self.next_at + p).max(now);
        }
    }
}

fn period_for(fps: f64) -> Option<Duration> {
    (fps.is_finite() && fps > 0.0).then(|| Duration::from_secs_f64(1.0 / fps))
}
