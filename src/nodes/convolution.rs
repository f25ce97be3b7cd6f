use cranelift::prelude::{InstBuilder, Value as IrValue};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::codegen::{accumulate, constant_table};
use crate::compiler::MapCompiler;
use crate::emitters::FunctionEmitter;
use crate::error::{CompileError, CompileResult, ModelError, ModelResult};
use crate::model::archive::{property, required_property};
use crate::model::{
    expect_inputs, ArchivableNode, ArchivedInputs, InputPort, Node, NodePorts, Numeric, OutputPort, PortElements,
    PortType, PortValues, TensorShape,
};
use crate::node_boilerplate;

/// How a convolution is lowered to code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConvolutionMethod {
    /// Picks one of the others from the layer geometry.
    Automatic,
    /// Loops over every output and every receptive-field element.
    Simple,
    /// Loops over outputs with the receptive field fully unrolled.
    Unrolled,
    /// Winograd minimal filtering; needs stride 1 and a 3×3 kernel.
    ///
    /// Layers assigned this method keep it in their metadata, but compiled
    /// code computes them with the direct `Simple` kernel. See `kernel`.
    Winograd,
}

/// Receptive fields up to this many elements are unrolled.
const UNROLL_LIMIT: usize = 64;

impl ConvolutionMethod {
    pub fn is_compatible(self, kernel_size: usize, stride: usize) -> bool {
        match self {
            ConvolutionMethod::Winograd => kernel_size == 3 && stride == 1,
            _ => true,
        }
    }

    /// Replaces `Automatic` with a concrete method for the given geometry.
    pub fn resolve(self, kernel_size: usize, stride: usize, channels: usize) -> ConvolutionMethod {
        if self != ConvolutionMethod::Automatic {
            return self;
        }
        if ConvolutionMethod::Winograd.is_compatible(kernel_size, stride) {
            ConvolutionMethod::Winograd
        } else if kernel_size * kernel_size * channels <= UNROLL_LIMIT {
            ConvolutionMethod::Unrolled
        } else {
            ConvolutionMethod::Simple
        }
    }

    /// The loop nest that compiled code actually uses for this method.
    pub fn kernel(self) -> ConvolutionMethod {
        match self {
            ConvolutionMethod::Unrolled => ConvolutionMethod::Unrolled,
            ConvolutionMethod::Simple | ConvolutionMethod::Winograd | ConvolutionMethod::Automatic => {
                ConvolutionMethod::Simple
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConvolutionMethod::Automatic => "automatic",
            ConvolutionMethod::Simple => "simple",
            ConvolutionMethod::Unrolled => "unrolled",
            ConvolutionMethod::Winograd => "winograd",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Geometry {
    columns: usize,
    channels: usize,
    kernel: usize,
    stride: usize,
    filters: usize,
    out_rows: usize,
    out_columns: usize,
}

impl Geometry {
    fn input_index(&self, row: usize, column: usize, channel: usize) -> usize {
        (row * self.columns + column) * self.channels + channel
    }

    fn weight_index(&self, filter: usize, row: usize, column: usize, channel: usize) -> usize {
        ((filter * self.kernel + row) * self.kernel + column) * self.channels + channel
    }

    fn output_index(&self, row: usize, column: usize, filter: usize) -> usize {
        (row * self.out_columns + column) * self.filters + filter
    }
}

/// 2-D convolution with valid padding over a `rows × columns × channels`
/// input, channels fastest.
///
/// Filters are laid out `[filter][kernel row][kernel column][channel]`; the
/// output has one channel per filter.
#[derive(Debug, Clone)]
pub struct ConvolutionNode {
    ports: NodePorts,
    input_shape: TensorShape,
    filters: PortValues,
    filter_count: usize,
    kernel_size: usize,
    stride: usize,
    method: ConvolutionMethod,
}

impl ConvolutionNode {
    pub fn new(
        input: PortElements,
        input_shape: TensorShape,
        filters: impl Into<PortValues>,
        filter_count: usize,
        kernel_size: usize,
        stride: usize,
    ) -> ModelResult<Self> {
        let filters = filters.into();
        let port_type = input.port_type();
        if port_type == PortType::Boolean {
            return Err(ModelError::InvalidArgument("convolutions need numeric values".into()));
        }
        if filters.port_type() != port_type {
            return Err(ModelError::TypeMismatch {
                expected: port_type,
                found: filters.port_type(),
            });
        }
        if input_shape.size() != input.size() {
            return Err(ModelError::InvalidArgument(format!(
                "shape {:?} does not cover {} inputs",
                input_shape,
                input.size()
            )));
        }
        if kernel_size == 0 || stride == 0 || filter_count == 0 {
            return Err(ModelError::InvalidArgument(
                "kernel size, stride and filter count must be positive".into(),
            ));
        }
        if kernel_size > input_shape.rows || kernel_size > input_shape.columns {
            return Err(ModelError::InvalidArgument(format!(
                "{0}x{0} kernel does not fit a {1}x{2} input",
                kernel_size, input_shape.rows, input_shape.columns
            )));
        }
        let expected = filter_count * kernel_size * kernel_size * input_shape.channels;
        if filters.len() != expected {
            return Err(ModelError::InvalidArgument(format!(
                "expected {} filter weights, got {}",
                expected,
                filters.len()
            )));
        }
        let out_shape = TensorShape::new(
            (input_shape.rows - kernel_size) / stride + 1,
            (input_shape.columns - kernel_size) / stride + 1,
            filter_count,
        );
        let output = OutputPort::new("output", port_type, out_shape.size()).with_shape(out_shape);
        Ok(Self {
            ports: NodePorts::new(vec![InputPort::new("input", input)], vec![output]),
            input_shape,
            filters,
            filter_count,
            kernel_size,
            stride,
            method: ConvolutionMethod::Simple,
        })
    }

    pub fn with_method(mut self, method: ConvolutionMethod) -> Self {
        self.method = method;
        self
    }

    pub fn input(&self) -> &PortElements {
        &self.ports.inputs[0].elements
    }

    pub fn method(&self) -> ConvolutionMethod {
        self.method
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn input_shape(&self) -> TensorShape {
        self.input_shape
    }

    pub fn output_shape(&self) -> TensorShape {
        self.ports.outputs[0].shape()
    }

    /// The method code is emitted with.
    pub fn effective_method(&self) -> ConvolutionMethod {
        self.method
            .resolve(self.kernel_size, self.stride, self.input_shape.channels)
    }

    fn geometry(&self) -> Geometry {
        let out = self.output_shape();
        Geometry {
            columns: self.input_shape.columns,
            channels: self.input_shape.channels,
            kernel: self.kernel_size,
            stride: self.stride,
            filters: self.filter_count,
            out_rows: out.rows,
            out_columns: out.columns,
        }
    }

    fn convolve<T: Numeric>(&self, x: &[T], w: &[T]) -> Vec<T> {
        let g = self.geometry();
        let mut y = vec![T::zero(); g.out_rows * g.out_columns * g.filters];
        for or in 0..g.out_rows {
            for oc in 0..g.out_columns {
                for fi in 0..g.filters {
                    let mut sum = T::zero();
                    for kr in 0..g.kernel {
                        for kc in 0..g.kernel {
                            for ch in 0..g.channels {
                                let xv = x[g.input_index(or * g.stride + kr, oc * g.stride + kc, ch)];
                                let wv = w[g.weight_index(fi, kr, kc, ch)];
                                sum = sum.plus(wv.times(xv));
                            }
                        }
                    }
                    y[g.output_index(or, oc, fi)] = sum;
                }
            }
        }
        y
    }

    fn emit_simple(
        &self,
        function: &mut FunctionEmitter,
        input: IrValue,
        weights: IrValue,
        output: IrValue,
    ) -> CompileResult<()> {
        let g = self.geometry();
        let pt = self.input().port_type();
        let slot = function.stack_buffer(pt.byte_size())?;
        let sum = function.stack_address(slot, 0);
        function.for_range(g.out_rows, |f, or| {
            f.for_range(g.out_columns, |f, oc| {
                f.for_range(g.filters, |f, fi| {
                    let zero = f.zero(pt);
                    f.store(zero, sum, 0);
                    f.for_range(g.kernel, |f, kr| {
                        f.for_range(g.kernel, |f, kc| {
                            let row = mul_add(f, or, g.stride, kr);
                            let column = mul_add(f, oc, g.stride, kc);
                            let pixel = mul_add(f, row, g.columns, column);
                            let x_first = f.ins().imul_imm(pixel, g.channels as i64);
                            let filter_row = mul_add(f, fi, g.kernel, kr);
                            let tap = mul_add(f, filter_row, g.kernel, kc);
                            let w_first = f.ins().imul_imm(tap, g.channels as i64);
                            f.for_range(g.channels, |f, ch| {
                                let xi = f.ins().iadd(x_first, ch);
                                let wi = f.ins().iadd(w_first, ch);
                                let x = f.load_element(pt, input, xi);
                                let w = f.load_element(pt, weights, wi);
                                let term = f.mul(pt, w, x);
                                accumulate(f, pt, sum, term);
                                Ok::<(), CompileError>(())
                            })
                        })
                    })?;
                    let pixel = mul_add(f, or, g.out_columns, oc);
                    let index = mul_add(f, pixel, g.filters, fi);
                    let y = f.load(pt, sum, 0);
                    f.store_element(pt, y, output, index);
                    Ok::<(), CompileError>(())
                })
            })
        })
    }

    fn emit_unrolled(
        &self,
        function: &mut FunctionEmitter,
        input: IrValue,
        weights: IrValue,
        output: IrValue,
    ) -> CompileResult<()> {
        let g = self.geometry();
        let pt = self.input().port_type();
        let filter_size = g.kernel * g.kernel * g.channels;
        function.for_range(g.out_rows, |f, or| {
            f.for_range(g.out_columns, |f, oc| {
                let row = f.ins().imul_imm(or, g.stride as i64);
                let column = f.ins().imul_imm(oc, g.stride as i64);
                let pixel = mul_add(f, row, g.columns, column);
                let x_first = f.ins().imul_imm(pixel, g.channels as i64);
                let window = f.element_address(pt, input, x_first);
                f.for_range(g.filters, |f, fi| {
                    let w_first = f.ins().imul_imm(fi, filter_size as i64);
                    let filter = f.element_address(pt, weights, w_first);
                    let mut sum = f.zero(pt);
                    for kr in 0..g.kernel {
                        for kc in 0..g.kernel {
                            for ch in 0..g.channels {
                                let x_offset = FunctionEmitter::element_offset(pt, g.input_index(kr, kc, ch))?;
                                let w_offset = FunctionEmitter::element_offset(pt, g.weight_index(0, kr, kc, ch))?;
                                let x = f.load(pt, window, x_offset);
                                let w = f.load(pt, filter, w_offset);
                                let term = f.mul(pt, w, x);
                                sum = f.add(pt, sum, term);
                            }
                        }
                    }
                    let pixel = mul_add(f, or, g.out_columns, oc);
                    let index = mul_add(f, pixel, g.filters, fi);
                    f.store_element(pt, sum, output, index);
                    Ok::<(), CompileError>(())
                })
            })
        })
    }
}

/// `a * k + b` on pointer-sized indices.
fn mul_add(function: &mut FunctionEmitter, a: IrValue, k: usize, b: IrValue) -> IrValue {
    let scaled = function.ins().imul_imm(a, k as i64);
    function.ins().iadd(scaled, b)
}

impl Node for ConvolutionNode {
    node_boilerplate!();

    fn type_name(&self) -> String {
        self.input().port_type().composite_name(Self::KIND)
    }

    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>> {
        expect_inputs(self, inputs)?;
        let output = match (&inputs[0], &self.filters) {
            (PortValues::Integer(x), PortValues::Integer(w)) => self.convolve(x, w).into(),
            (PortValues::BigInt(x), PortValues::BigInt(w)) => self.convolve(x, w).into(),
            (PortValues::SmallReal(x), PortValues::SmallReal(w)) => self.convolve(x, w).into(),
            (PortValues::Real(x), PortValues::Real(w)) => self.convolve(x, w).into(),
            (x, w) => {
                return Err(ModelError::TypeMismatch {
                    expected: w.port_type(),
                    found: x.port_type(),
                })
            }
        };
        Ok(vec![output])
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, compiler: &mut MapCompiler, function: &mut FunctionEmitter) -> CompileResult<()> {
        let input = compiler.input_address(function, self.input())?;
        let weights = constant_table(compiler, function, "filters", &self.filters)?;
        let output = compiler.output_address(function, 0)?;
        let method = self.effective_method();
        let kernel = method.kernel();
        log::trace!("convolution assigned {} lowered as {}", method.name(), kernel.name());
        if kernel == ConvolutionMethod::Unrolled {
            self.emit_unrolled(function, input, weights, output)
        } else {
            self.emit_simple(function, input, weights, output)
        }
    }

    fn properties(&self) -> ModelResult<Value> {
        Ok(json!({
            "inputShape": self.input_shape,
            "filters": self.filters,
            "filterCount": self.filter_count,
            "kernelSize": self.kernel_size,
            "stride": self.stride,
            "method": self.method,
        }))
    }
}

impl ArchivableNode for ConvolutionNode {
    const KIND: &'static str = "ConvolutionNode";

    fn from_archive(_port_type: Option<PortType>, properties: &Value, inputs: &ArchivedInputs) -> ModelResult<Self> {
        let filters: PortValues = required_property(properties, "filters")?;
        let node = Self::new(
            inputs.get("input")?,
            required_property(properties, "inputShape")?,
            filters,
            required_property(properties, "filterCount")?,
            required_property(properties, "kernelSize")?,
            required_property(properties, "stride")?,
        )?;
        let method = property(properties, "method")?.unwrap_or(ConvolutionMethod::Simple);
        Ok(node.with_method(method))
    }
}
