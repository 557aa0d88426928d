use crate::error::{DpErr, Result};

/// Static description of one model parameter, flattened.
#[derive(Debug, Clone)]
pub struct ParamMeta {
    name: String,
    len: usize,
    requires_grad: bool,
}

impl ParamMeta {
    /// Creates a parameter description.
    ///
    /// # Args
    /// * `name` - Stable identifier used in errors and logs.
    /// * `len` - Number of coordinates in the flattened tensor.
    /// * `requires_grad` - Whether the parameter takes part in training.
    pub fn new(name: impl Into<String>, len: usize, requires_grad: bool) -> Self {
        Self {
            name: name.into(),
            len,
            requires_grad,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }
}

/// The model's parameters in a fixed order, identical on every worker.
///
/// The order is load-bearing: workers walk the layout in index order when
/// reducing, and the collective combines whatever each worker currently
/// contributes, so two workers with different layouts will not pair up
/// matching parameters.
#[derive(Debug, Clone)]
pub struct ParamLayout {
    metas: Vec<ParamMeta>,
}

impl ParamLayout {
    pub fn new(metas: Vec<ParamMeta>) -> Self {
        Self { metas }
    }

    pub fn len(&self) -> usize {
        self.metas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ParamMeta> {
        self.metas.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParamMeta> {
        self.metas.iter()
    }

    /// Number of parameters that take part in training.
    pub fn trainable_count(&self) -> usize {
        self.metas.iter().filter(|m| m.requires_grad()).count()
    }
}

/// The summed and in-flight gradient buffers of one trainable parameter.
#[derive(Debug)]
pub struct ParamGrad {
    name: String,
    summed: Vec<f32>,
    current: Option<Vec<f32>>,
}

impl ParamGrad {
    pub(crate) fn new(name: String, summed: Vec<f32>) -> Self {
        Self {
            name,
            summed,
            current: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The locally accumulated, already-clipped gradient for this step.
    pub fn summed(&self) -> &[f32] {
        &self.summed
    }

    /// The gradient entering (or leaving) the cross-worker combine, absent
    /// until a noise strategy ran.
    pub fn current(&self) -> Option<&[f32]> {
        self.current.as_deref()
    }

    /// Installs the gradient that will enter the cross-worker combine.
    ///
    /// # Errors
    /// Returns `GradLengthMismatch` if `current` disagrees with the summed
    /// gradient's length.
    pub fn set_current(&mut self, current: Vec<f32>) -> Result<()> {
        if current.len() != self.summed.len() {
            return Err(DpErr::GradLengthMismatch {
                param: self.name.clone(),
                got: current.len(),
                expected: self.summed.len(),
            });
        }

        self.current = Some(current);
        Ok(())
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut Vec<f32>> {
        self.current.as_mut()
    }

    /// The in-flight gradient, or the error a skipped noise stage deserves.
    pub(crate) fn current_mut_or_missing(&mut self) -> Result<&mut Vec<f32>> {
        match self.current.as_mut() {
            Some(current) => Ok(current),
            None => Err(DpErr::MissingCurrentGrad {
                param: self.name.clone(),
            }),
        }
    }
}

/// Per-step gradient state, created when local accumulation is finalized and
/// discarded once the step completes.
///
/// Entries are index-aligned with the layout; non-trainable parameters hold
/// `None` and are never touched by the noise or reduction stages. Owning the
/// buffers here, rather than in long-lived fields, is what guarantees that no
/// gradient state carries over between steps.
#[derive(Debug)]
pub struct StepGrads {
    grads: Vec<Option<ParamGrad>>,
}

impl StepGrads {
    pub(crate) fn new(grads: Vec<Option<ParamGrad>>) -> Self {
        Self { grads }
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// The step state of the parameter at `index`, `None` if the parameter
    /// does not take gradients.
    pub fn param(&self, index: usize) -> Option<&ParamGrad> {
        self.grads.get(index).and_then(Option::as_ref)
    }

    pub fn trainable(&self) -> impl Iterator<Item = &ParamGrad> {
        self.grads.iter().flatten()
    }

    pub fn trainable_mut(&mut self) -> impl Iterator<Item = &mut ParamGrad> {
        self.grads.iter_mut().flatten()
    }

    pub fn trainable_count(&self) -> usize {
        self.grads.iter().flatten().count()
    }

    /// The final per-parameter gradients, index-aligned with the layout.
    ///
    /// Entries are `None` for parameters that hold no reducible gradient.
    pub fn currents(&self) -> Vec<Option<&[f32]>> {
        self.grads
            .iter()
            .map(|grad| grad.as_ref().and_then(ParamGrad::current))
            .collect()
    }
}
