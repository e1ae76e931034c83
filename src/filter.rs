//! Temporal smoothing of landmarks.

mod ema;

pub use ema::Ema;

use crate::{gpu::Buffer, gpu::Device, iter::zip_exact, landmark::LandmarkSet};

/// A filter for values of type `V`.
///
/// Filters don't store any state themselves; it is passed in as a [`Filter::State`] instead, so
/// that a single set of filter parameters can be shared by many filtered values.
pub trait Filter<V> {
    /// Per-value filter state. The [`Default`] value is the state before the first sample.
    type State: Default;

    /// Adds a new value to the filter, returning the filtered value.
    fn filter(&self, state: &mut Self::State, value: V) -> V;
}

/// A [`Filter`] bundled with the state of a single filtered value.
pub struct SimpleFilter<V, F: Filter<V>> {
    filter: F,
    state: F::State,
}

impl<V, F: Filter<V>> SimpleFilter<V, F> {
    pub fn new(filter: F) -> Self {
        Self {
            filter,
            state: F::State::default(),
        }
    }

    pub fn filter(&mut self, value: V) -> V {
        self.filter.filter(&mut self.state, value)
    }

    /// Resets the filter state to its initial value.
    pub fn reset(&mut self) {
        self.state = F::State::default();
    }
}

/// Smooths every coordinate of a [`LandmarkSet`] over time.
///
/// The stabilized output is only ever changed by [`LandmarkFilter::filter`] and
/// [`LandmarkFilter::reset`], so frames without a landmark update leave it untouched.
pub struct LandmarkFilter<F: Filter<f32> = Ema> {
    filter: F,
    states: Vec<[F::State; 3]>,
    output: Option<LandmarkSet>,
}

impl<F: Filter<f32>> LandmarkFilter<F> {
    /// Creates a landmark filter for sets of `num_landmarks` landmarks.
    pub fn new(filter: F, num_landmarks: usize) -> Self {
        Self {
            filter,
            states: (0..num_landmarks).map(|_| Default::default()).collect(),
            output: None,
        }
    }

    /// Returns the number of landmarks per filtered set.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Feeds a new observation into the filter and returns the stabilized landmarks.
    ///
    /// The first observation after construction or [`LandmarkFilter::reset`] is returned as-is.
    ///
    /// # Panics
    ///
    /// Panics if `raw` does not contain exactly as many landmarks as the filter was created for.
    pub fn filter(&mut self, raw: &LandmarkSet) -> &LandmarkSet {
        let output = self
            .output
            .get_or_insert_with(|| LandmarkSet::new(raw.len()));
        for ((out, raw), states) in zip_exact(
            zip_exact(output.positions_mut(), raw.positions()),
            &mut self.states,
        ) {
            for ((out, &raw), state) in out.iter_mut().zip(raw).zip(states) {
                *out = self.filter.filter(state, raw);
            }
        }
        output
    }

    /// Returns the stabilized landmarks, or [`None`] if nothing has been observed since
    /// construction or the last reset.
    pub fn stabilized(&self) -> Option<&LandmarkSet> {
        self.output.as_ref()
    }

    /// Forgets all observations.
    pub fn reset(&mut self) {
        for state in &mut self.states {
            *state = Default::default();
        }
        self.output = None;
    }

    /// Uploads the stabilized landmarks to `buffer`.
    ///
    /// Each landmark is stored as `[x, y, z, valid]`, with `valid` being 1.0 if there is a
    /// stabilized value and 0.0 otherwise.
    pub fn upload<D: Device>(&self, device: &D, buffer: &Buffer<D, [f32; 4]>) {
        let records = match &self.output {
            Some(set) => set
                .positions()
                .iter()
                .map(|&[x, y, z]| [x, y, z, 1.0])
                .collect::<Vec<_>>(),
            None => vec![[0.0; 4]; self.states.len()],
        };
        buffer.write(device, &records);
    }
}
