use crate::error::{Result, RsisError};

pub type StepFn = Box<dyn FnMut() -> Result<()> + Send>;

/// A periodic unit of work bound to a thread handler
pub struct Callback {
    name: String,
    frequency: f64,
    frame_offset: u64,
    func: StepFn,
}

impl Callback {
    pub fn new<F>(name: impl Into<String>, frequency: f64, frame_offset: u64, func: F) -> Self
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            frequency,
            frame_offset,
            func: Box::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn frame_offset(&self) -> u64 {
        self.frame_offset
    }

    pub fn call(&mut self) -> Result<()> {
        (self.func)()
    }

    /// Number of handler ticks between invocations at `thread_frequency`
    pub fn divisor(&self, thread_frequency: f64) -> Result<u64> {
        if !self.frequency.is_finite() || self.frequency <= 0.0 {
            return Err(RsisError::InvalidFrequency(self.frequency));
        }
        if self.frequency > thread_frequency {
            return Err(RsisError::CallbackTooFast {
                name: self.name.clone(),
                callback: self.frequency,
                thread: thread_frequency,
            });
        }
        let divisor = integer_ratio(thread_frequency, self.frequency)?;
        if self.frame_offset >= divisor {
            return Err(RsisError::FrameOffset {
                offset: self.frame_offset,
                divisor,
            });
        }
        Ok(divisor)
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("name", &self.name)
            .field("frequency", &self.frequency)
            .field("frame_offset", &self.frame_offset)
            .finish()
    }
}

/// `fast / slow` as an integer, tolerating floating point noise
pub(crate) fn integer_ratio(fast: f64, slow: f64) -> Result<u64> {
    let ratio = fast / slow;
    let rounded = ratio.round();
    if rounded < 1.0 || (ratio - rounded).abs() > 1e-9 * ratio {
        return Err(RsisError::NonIntegerRate { fast, slow });
    }
    Ok(rounded as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str, frequency: f64, offset: u64) -> Callback {
        Callback::new(name, frequency, offset, || Ok(()))
    }

    #[test]
    fn test_divisor() {
        assert_eq!(noop("a", 10.0, 0).divisor(100.0), Ok(10));
        assert_eq!(noop("b", 100.0, 0).divisor(100.0), Ok(1));
        assert_eq!(noop("c", 0.1, 0).divisor(0.3), Ok(3));
    }

    #[test]
    fn test_divisor_rejections() {
        assert!(matches!(
            noop("fast", 200.0, 0).divisor(100.0),
            Err(RsisError::CallbackTooFast { .. })
        ));
        assert!(matches!(
            noop("odd", 30.0, 0).divisor(100.0),
            Err(RsisError::NonIntegerRate { .. })
        ));
        assert_eq!(
            noop("late", 50.0, 2).divisor(100.0),
            Err(RsisError::FrameOffset { offset: 2, divisor: 2 })
        );
        assert!(noop("zero", 0.0, 0).divisor(100.0).is_err());
    }

    #[test]
    fn test_call_runs_closure() {
        let mut count = 0;
        let mut cb = Callback::new("count", 1.0, 0, move || {
            count += 1;
            if count > 1 {
                Err(RsisError::Command("twice".into()))
            } else {
                Ok(())
            }
        });
        assert!(cb.call().is_ok());
        assert!(cb.call().is_err());
    }
}
