//! Exponential moving average.

use super::Filter;

/// Blends every new sample into the running average with a fixed weight.
///
/// The first sample after a reset is passed through unchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ema {
    weight: f32,
}

impl Ema {
    /// Creates an EMA that gives new samples a weight of `weight`.
    ///
    /// A weight of 1.0 disables smoothing, lower weights smooth more and lag more.
    ///
    /// # Panics
    ///
    /// Panics if `weight` is outside of `[0, 1]`.
    pub fn new(weight: f32) -> Self {
        assert!(
            (0.0..=1.0).contains(&weight),
            "EMA weight must be in [0, 1], got {weight}"
        );
        Self { weight }
    }

    pub fn weight(&self) -> f32 {
        self.weight
    }
}

/// The running average of an [`Ema`], empty until the first sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct State(Option<f32>);

impl Filter<f32> for Ema {
    type State = State;

    fn filter(&self, state: &mut State, value: f32) -> f32 {
        let smoothed = state
            .0
            .map_or(value, |avg| avg + self.weight * (value - avg));
        state.0 = Some(smoothed);
        smoothed
    }
}

#[cfg(test)]
mod tests {
    use crate::filter::SimpleFilter;

    use super::*;

    #[test]
    fn halfway_steps() {
        let mut filter = SimpleFilter::new(Ema::new(0.5));
        assert_eq!(filter.filter(1.0), 1.0);
        assert_eq!(filter.filter(2.0), 1.5);
        assert_eq!(filter.filter(2.0), 1.75);

        filter.reset();
        assert_eq!(filter.filter(8.0), 8.0);
    }

    #[test]
    fn full_weight_tracks_input() {
        let mut filter = SimpleFilter::new(Ema::new(1.0));
        filter.filter(3.0);
        assert_eq!(filter.filter(-2.0), -2.0);
    }

    #[test]
    fn zero_weight_holds_first_sample() {
        let mut filter = SimpleFilter::new(Ema::new(0.0));
        filter.filter(3.0);
        assert_eq!(filter.filter(100.0), 3.0);
    }

    #[test]
    #[should_panic]
    fn weight_out_of_range() {
        Ema::new(1.5);
    }
}
