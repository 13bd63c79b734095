use super::layer::Forward;
use crate::{
    error::StyleTransferError,
    tensor::{into_standard_layout, ArcTensor, ArcTensorD},
};
use anyhow::Result;
use ndarray::{
    linalg::Dot, ArcArray, ArrayViewMut, Dimension, IntoDimension, Ix0, Ix1, Ix2, Ix4, IxDyn,
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    marker::PhantomData,
    sync::{Arc, Weak},
};

type GradLock = Arc<RwLock<Option<ArcTensorD>>>;

/// Builders.
pub mod builder {
    use super::*;

    /// VariableBuilder.
    ///
    ///```no_run
    /// # use anyhow::Result;
    /// # use stylegraph::{tensor::ArcTensor2, learn::neural_network::autograd::{Variable, Variable2}};
    /// # let input: Variable2 = todo!();
    /// let mut builder = Variable::builder();
    /// if let Some(node) = input.node() {
    ///     // Add an edge computing the input gradient from the output gradient.
    ///     builder.edge(node, |output_grad: ArcTensor2| -> Result<ArcTensor2> { todo!() });
    /// }
    /// let output_value: ArcTensor2 = todo!();
    /// # let _ = {
    /// builder.build(output_value)
    /// # };
    ///```
    pub struct VariableBuilder<D: Dimension> {
        grad: Option<GradLock>,
        edges: Vec<EdgeInner>,
        _m: PhantomData<D>,
    }

    impl<D: Dimension + 'static> VariableBuilder<D> {
        pub(super) fn new() -> Self {
            Self {
                grad: None,
                edges: Vec::new(),
                _m: PhantomData,
            }
        }
        /// Adds an edge.
        ///
        /// During the backward pass, for each edge to `node`, `f` computes the gradient of `node`
        /// given the gradient of `self`.
        /// When multiple edges compute the same gradient, they are added together.
        /// Once there are no more edges needed to compute a gradient for a node, its edges can
        /// be computed.
        pub fn edge<D2, F>(&mut self, node: &Node<D2>, f: F)
        where
            D2: Dimension + 'static,
            F: FnOnce(ArcTensor<D>) -> Result<ArcTensor<D2>> + Send + Sync + 'static,
        {
            let output_grad_lock = self
                .grad
                .get_or_insert_with(|| Arc::new(RwLock::default()))
                .clone();
            let mut output_grad_lock = Some(output_grad_lock);
            let node = node.inner.clone();
            let mut input_grad_lock = Arc::downgrade(&node.grad);
            let dim = node.dim.clone();
            let name = std::any::type_name::<F>();
            let mut f = Some(f);
            let op = Box::new(move || -> Result<()> {
                let input_grad_lock = Weak::upgrade(&std::mem::take(&mut input_grad_lock));
                if let Some((f, (input_grad_lock, output_grad_lock))) =
                    f.take().zip(input_grad_lock.zip(output_grad_lock.take()))
                {
                    let grad = output_grad_lock.read().clone();
                    std::mem::drop(output_grad_lock);
                    let Some(grad) = grad else {
                        return Ok(());
                    };
                    let grad = (f)(grad.into_dimensionality::<D>()?)?;
                    if grad.shape() != dim.slice() {
                        log::error!("{name}: gradient shape mismatch");
                        return Err(
                            StyleTransferError::shape_mismatch(dim.slice(), grad.shape()).into(),
                        );
                    }
                    let grad = grad.into_dyn();
                    let mut guard = input_grad_lock.write();
                    if let Some(input_grad) = guard.as_mut() {
                        *input_grad += &grad;
                    } else {
                        guard.replace(grad);
                    }
                }
                Ok(())
            });
            self.edges.push(EdgeInner { name, op, node })
        }
        /// Builds the variable with `value`.
        pub fn build(self, value: ArcTensor<D>) -> Variable<D> {
            let Self { grad, edges, .. } = self;
            let node = grad.map(|grad| Node::new(value.raw_dim().into_dyn(), grad, edges));
            Variable { value, node }
        }
    }
}
use builder::*;

struct EdgeInner {
    name: &'static str,
    op: Box<dyn FnMut() -> Result<()> + Send + Sync + 'static>,
    node: Arc<NodeInner>,
}

impl Debug for EdgeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeInner")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish()
    }
}

#[derive(Debug)]
struct NodeInner {
    dim: IxDyn,
    grad: GradLock,
    edges: Mutex<Vec<EdgeInner>>,
}

impl NodeInner {
    fn ready(&self) -> bool {
        Arc::weak_count(&self.grad) == 0
    }
}

/// Node.
///
/// Nodes store gradients and can be connected via [`VariableBuilder::edge()`] to
/// form a graph that is traversed in [`.backward()`](Node::backward).
#[derive(Clone, Debug)]
pub struct Node<D: Dimension> {
    inner: Arc<NodeInner>,
    _m: PhantomData<D>,
}

impl<D: Dimension> Node<D> {
    fn new(dim: IxDyn, grad: GradLock, edges: Vec<EdgeInner>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                dim,
                grad,
                edges: Mutex::new(edges),
            }),
            _m: PhantomData,
        }
    }
    /// The gradient.
    pub fn grad(&self) -> Option<ArcTensor<D>> {
        self.inner.grad.read().clone()?.into_dimensionality().ok()
    }
    /// Executes the backward pass.
    ///
    /// The gradient of `self` is ones.
    pub fn backward(&self) -> Result<()> {
        self.backward_grad(ArcArray::ones(self.inner.dim.clone()).into_dimensionality::<D>()?)
    }
    /// Executes the backward pass with `grad`.
    ///
    /// Does nothing if the gradient has already been computed.
    pub fn backward_grad(&self, grad: ArcTensor<D>) -> Result<()> {
        {
            let mut guard = self.inner.grad.write();
            if guard.is_some() {
                return Ok(());
            }
            guard.replace(grad.into_dyn());
        }
        let mut queue = VecDeque::new();
        queue.push_back(self.inner.clone());
        while let Some(node) = queue.pop_front() {
            let edges = std::mem::take(&mut *node.edges.lock());
            std::mem::drop(node);
            for mut edge in edges {
                (edge.op)()?;
                let node = edge.node;
                if node.ready() {
                    queue.push_back(node.clone())
                }
            }
        }
        Ok(())
    }
}

/// Variable.
///
/// Variables are tensors with an optional [`Node`] that stores a gradient. Numerical operations
/// on variables with a node create a graph of edges that is traversed during the backward pass
/// to compute the gradients.
///
/// Variables created from tensors via [`From`] do not have a node, so no gradient flows into
/// them.
/// Use [`builder()`](Variable::builder) to create a Variable as a function of another variable.
#[derive(Clone, Debug)]
pub struct Variable<D: Dimension> {
    value: ArcTensor<D>,
    node: Option<Node<D>>,
}

/// Variable with 1 element
pub type Variable0 = Variable<Ix0>;
/// Variable with 2 dimensions
pub type Variable2 = Variable<Ix2>;
/// Variable with 4 dimensions
pub type Variable4 = Variable<Ix4>;

impl<D: Dimension + 'static> Variable<D> {
    /// A `VariableBuilder` for creating nodes and edges.
    pub fn builder() -> VariableBuilder<D> {
        VariableBuilder::new()
    }
    /// The value of the variable.
    pub fn value(&self) -> &ArcTensor<D> {
        &self.value
    }
    /// Converts the variable into a tensor.
    pub fn into_value(self) -> ArcTensor<D> {
        self.value
    }
    /// The node.
    pub fn node(&self) -> Option<&Node<D>> {
        self.node.as_ref()
    }
    /// Whether a gradient will be computed for this variable.
    pub fn requires_grad(&self) -> bool {
        self.node.is_some()
    }
    /// A copy of the variable without a node.
    ///
    /// The result is a constant with respect to the backward pass.
    pub fn detach(&self) -> Self {
        Self {
            value: self.value.clone(),
            node: None,
        }
    }
    /// Maps the variable with `F`.
    ///
    /// Shortcut for `f.forward(self)`. This allows chaining methods together.
    pub fn forward<F: Forward<Self>>(self, f: &F) -> Result<F::Output> {
        f.forward(self)
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim in pattern form.
    pub fn dim(&self) -> D::Pattern {
        self.value.dim()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// Converts into `shape`.
    ///
    /// The value is copied into standard layout if necessary.
    pub fn into_shape<E>(self, shape: E) -> Result<Variable<E::Dim>>
    where
        E: IntoDimension,
        E::Dim: 'static,
    {
        let dim = self.raw_dim();
        let mut builder = Variable::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad: ArcTensor<E::Dim>| {
                Ok(into_standard_layout(output_grad).into_shape(dim)?)
            })
        }
        let value = into_standard_layout(self.value).into_shape(shape)?;
        Ok(builder.build(value))
    }
    /// Reverses (transposes) the axes of the variable.
    pub fn reversed_axes(self) -> Self {
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, |output_grad| Ok(output_grad.reversed_axes()));
        }
        builder.build(self.value.reversed_axes())
    }
    /// Transposes the variable.
    pub fn t(&self) -> Self {
        self.clone().reversed_axes()
    }
    /// Multiplies the variable by `alpha`.
    pub fn scale(&self, alpha: f32) -> Self {
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| {
                Ok(output_grad.mapv(|dy| alpha * dy).into_shared())
            });
        }
        builder.build(self.value.mapv(|x| alpha * x).into_shared())
    }
    /// Adds `rhs` to the variable.
    ///
    /// **Errors**
    ///
    /// The shapes must be equal.
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        if self.shape() != rhs.shape() {
            return Err(StyleTransferError::shape_mismatch(self.shape(), rhs.shape()).into());
        }
        let mut builder = Self::builder();
        for node in [self.node(), rhs.node()].into_iter().flatten() {
            builder.edge(node, Ok);
        }
        Ok(builder.build((&self.value + &rhs.value).into_shared()))
    }
    /// Sums all elements.
    pub fn sum(&self) -> Variable0 {
        let mut builder = Variable0::builder();
        if let Some(node) = self.node() {
            let dim = self.raw_dim();
            builder.edge(node, move |output_grad: ArcTensor<Ix0>| {
                Ok(ArcArray::from_elem(dim, output_grad[()]))
            });
        }
        builder.build(ArcArray::from_elem((), self.value.sum()))
    }
}

impl Variable0 {
    /// The value as an `f32`.
    pub fn scalar(&self) -> f32 {
        self.value[()]
    }
    /// Executes the backward pass.
    ///
    /// See [`Node::backward`].
    pub fn backward(&self) -> Result<()> {
        if let Some(node) = self.node.as_ref() {
            node.backward()?;
        }
        Ok(())
    }
}

impl<D: Dimension> From<crate::tensor::Tensor<D>> for Variable<D> {
    fn from(tensor: crate::tensor::Tensor<D>) -> Self {
        Self::from(tensor.into_shared())
    }
}

impl<D: Dimension> From<ArcTensor<D>> for Variable<D> {
    fn from(tensor: ArcTensor<D>) -> Self {
        Self {
            value: tensor,
            node: None,
        }
    }
}

impl Dot<Self> for Variable2 {
    type Output = Result<Self>;
    fn dot(&self, rhs: &Self) -> Result<Self> {
        let lhs = self;
        let (m, k) = lhs.dim();
        let (k2, n) = rhs.dim();
        if k != k2 {
            return Err(StyleTransferError::shape_mismatch(&[k, n], rhs.shape()).into());
        }
        let mut builder = Self::builder();
        if let Some(node) = lhs.node() {
            let rhs = rhs.value().clone();
            builder.edge(node, move |output_grad| {
                Ok(output_grad.dot(&rhs.t()).into_shared())
            });
        }
        if let Some(node) = rhs.node() {
            let lhs = lhs.value().clone();
            builder.edge(node, move |output_grad| {
                Ok(lhs.t().dot(&output_grad).into_shared())
            });
        }
        let value = lhs.value().dot(rhs.value());
        debug_assert_eq!(value.dim(), (m, n));
        Ok(builder.build(value.into_shared()))
    }
}

/// Parameter.
///
/// The value of a parameter is updated by an [`Optimizer`](super::optimizer::Optimizer). A
/// Parameter can be converted to a [`Variable`] via [`.to_variable()`](Parameter::to_variable),
/// which allows it to be used in operations.
/// During training, [`.set_training(true)`](Parameter::set_training) ensures that
/// the variable created from this parameter has a [`Node`], and the gradient computed in the
/// backward pass is stored in the parameter.
#[derive(Clone)]
pub struct Parameter<D: Dimension> {
    value: ArcTensor<D>,
    grad: Option<GradLock>,
}

/// Parameter with 1 dimension.
pub type Parameter1 = Parameter<Ix1>;
/// Parameter with 2 dimensions.
pub type Parameter2 = Parameter<Ix2>;
/// Parameter with 4 dimensions.
pub type Parameter4 = Parameter<Ix4>;

impl<D: Dimension> Parameter<D> {
    /// The value of the parameter.
    pub fn value(&self) -> &ArcTensor<D> {
        &self.value
    }
    /// Borrows the value mutably.
    ///
    /// Copies the value if it is shared, for example by a variable created with
    /// [`.to_variable()`](Parameter::to_variable).
    pub fn value_view_mut(&mut self) -> ArrayViewMut<f32, D> {
        self.value.view_mut()
    }
    /// Converts the parameter into its value.
    pub fn into_value(self) -> ArcTensor<D> {
        self.value
    }
    /// The gradient of the parameter.
    pub fn grad(&self) -> Option<ArcTensor<D>> {
        self.grad
            .as_ref()?
            .read()
            .clone()?
            .into_dimensionality()
            .ok()
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// Enables / disables training.
    ///
    /// If `training`, ensures that when the parameter is converted to a [`Variable`],
    /// it will have a [`Node`] for computing a gradient.
    /// If `training` is false, discards any gradient that has been computed.
    pub fn set_training(&mut self, training: bool) {
        if training && self.grad.is_none() {
            self.grad.replace(Arc::new(RwLock::default()));
        } else if !training {
            self.grad = None;
        }
    }
    /// Discards the accumulated gradient.
    ///
    /// Graphs created from previous variables no longer write into this parameter.
    pub fn zero_grad(&mut self) {
        if let Some(grad) = self.grad.as_mut() {
            *grad = Arc::new(RwLock::default());
        }
    }
    /// Converts to a `Variable`.
    pub fn to_variable(&self) -> Variable<D> {
        let value = self.value.clone();
        let node = self
            .grad
            .as_ref()
            .map(|grad| Node::new(value.raw_dim().into_dyn(), grad.clone(), Vec::new()));
        Variable { value, node }
    }
}

impl<D: Dimension> From<crate::tensor::Tensor<D>> for Parameter<D> {
    fn from(tensor: crate::tensor::Tensor<D>) -> Self {
        Self::from(tensor.into_shared())
    }
}

impl<D: Dimension> From<ArcTensor<D>> for Parameter<D> {
    fn from(tensor: ArcTensor<D>) -> Self {
        Self {
            value: tensor,
            grad: None,
        }
    }
}

impl<D: Dimension> Debug for Parameter<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("value", &self.value)
            .field("grad", &self.grad)
            .finish()
    }
}
