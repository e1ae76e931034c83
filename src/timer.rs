//! Stage timing and FPS logging.

use std::{
    fmt,
    time::{Duration, Instant},
};

/// Measures and averages how long a pipeline stage takes.
///
/// [`FpsCounter::tick_with`] resets the timers it logs, so each log line shows the averages of the
/// last second.
pub struct Timer {
    name: &'static str,
    total: Duration,
    count: u32,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            total: Duration::ZERO,
            count: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Invokes a closure, measuring and recording the time it takes.
    pub fn time<T>(&mut self, timee: impl FnOnce() -> T) -> T {
        let _guard = self.start();
        timee()
    }

    /// Starts timing an operation; the time is recorded when the returned guard is dropped.
    pub fn start(&mut self) -> TimerGuard<'_> {
        TimerGuard {
            start: Instant::now(),
            timer: self,
        }
    }

    /// Returns the average duration recorded since the last reset, if any.
    pub fn average(&self) -> Option<Duration> {
        if self.count == 0 {
            None
        } else {
            Some(self.total / self.count)
        }
    }

    pub fn reset(&mut self) {
        self.total = Duration::ZERO;
        self.count = 0;
    }

    fn record(&mut self, duration: Duration) {
        self.total += duration;
        self.count += 1;
    }
}

/// Displays the average recorded time.
impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.average() {
            Some(avg) => write!(
                f,
                "{}: {}x{:.01}ms",
                self.name,
                self.count,
                avg.as_secs_f32() * 1000.0
            ),
            None => write!(f, "{}: -", self.name),
        }
    }
}

/// Guard returned by [`Timer::start`].
pub struct TimerGuard<'a> {
    start: Instant,
    timer: &'a mut Timer,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.timer.record(self.start.elapsed());
    }
}

/// Logs frames per second, optionally with a set of stage [`Timer`]s.
pub struct FpsCounter {
    name: String,
    frames: u32,
    start: Instant,
}

impl FpsCounter {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            frames: 0,
            start: Instant::now(),
        }
    }

    /// Advances the frame counter and logs FPS once a second has passed.
    pub fn tick(&mut self) {
        self.tick_with(std::iter::empty::<&mut Timer>());
    }

    /// Advances the frame counter and, once a second has passed, logs FPS together with the
    /// averages of `timers` (which are reset afterwards).
    pub fn tick_with<'a, I: IntoIterator<Item = &'a mut Timer>>(&mut self, timers: I) {
        self.frames += 1;
        if self.start.elapsed() < Duration::from_secs(1) {
            return;
        }

        let stages = timers
            .into_iter()
            .map(|timer| {
                let s = timer.to_string();
                timer.reset();
                s
            })
            .collect::<Vec<_>>();
        if stages.is_empty() {
            log::debug!("{}: {} FPS", self.name, self.frames);
        } else {
            log::debug!("{}: {} FPS ({})", self.name, self.frames, stages.join(", "));
        }

        self.frames = 0;
        self.start = Instant::now();
    }
}
