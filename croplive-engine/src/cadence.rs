/// Classification of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Sent as a complete user turn with the analysis prompt attached;
    /// forces a model response.
    Prompted,
    /// Sent as realtime input only; context for the model, no response.
    Context,
}

/// 1-based frame counter: every `divisor`-th frame is prompted, the rest
/// are context. With the production divisor of 3 that is a 10:20
/// prompted-to-context ratio over any 30-frame window.
#[derive(Debug)]
pub struct FrameCadence {
    divisor: u32,
    counter: u32,
}

impl FrameCadence {
    pub fn new(divisor: u32) -> Self {
        Self {
            divisor: divisor.max(1),
            counter: 0,
        }
    }

    pub fn next(&mut self) -> FrameClass {
        self.counter = self.counter.wrapping_add(1);
        if self.counter % self.divisor == 0 {
            FrameClass::Prompted
        } else {
            FrameClass::Context
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_third_frame_is_prompted() {
        let mut cadence = FrameCadence::new(3);
        let classes: Vec<FrameClass> = (0..9).map(|_| cadence.next()).collect();
        for (i, class) in classes.iter().enumerate() {
            let n = i + 1;
            if n % 3 == 0 {
                assert_eq!(*class, FrameClass::Prompted, "frame {n}");
            } else {
                assert_eq!(*class, FrameClass::Context, "frame {n}");
            }
        }
    }

    #[test]
    fn thirty_frame_window_is_ten_to_twenty() {
        let mut cadence = FrameCadence::new(3);
        let prompted = (0..30)
            .map(|_| cadence.next())
            .filter(|c| *c == FrameClass::Prompted)
            .count();
        assert_eq!(prompted, 10);
    }

    #[test]
    fn divisor_zero_degrades_to_every_frame_prompted() {
        let mut cadence = FrameCadence::new(0);
        assert_eq!(cadence.next(), FrameClass::Prompted);
        assert_eq!(cadence.next(), FrameClass::Prompted);
    }
}
