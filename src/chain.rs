//! Chain: an ordered operator pipeline binding one input to one output.

use std::fmt;
use std::sync::Arc;

use crate::op::{Controller, ControllerBinding, Operator};
use crate::proxy::ProxyRing;
use crate::error::EngineError;
use crate::SampleBuffer;

/// How a chain endpoint reaches its audio object.
///
/// The chainsetup keeps direct objects in indexed tables and loop devices in
/// a dedicated map; a proxied endpoint additionally carries the ring its
/// data travels through. Slots are cheap handles - the objects themselves
/// are owned exactly once, by the chainsetup or by the proxy worker.
#[derive(Clone)]
pub enum Slot {
    /// Object driven directly by the engine thread.
    Direct(usize),
    /// Loop device, shared between the input and output tables.
    Loop(u32),
    /// Object owned by the proxy worker; data flows through the ring.
    Proxied {
        /// Index of the underlying object in the direct table.
        direct: usize,
        /// The ring between the engine and the proxy worker.
        ring: Arc<ProxyRing>,
    },
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(idx) => write!(f, "Direct({idx})"),
            Self::Loop(id) => write!(f, "Loop({id})"),
            Self::Proxied { direct, .. } => write!(f, "Proxied({direct})"),
        }
    }
}

/// An ordered list of operators and controllers between one input slot and
/// one output slot.
///
/// Operators are applied in insertion order; controllers are evaluated in
/// insertion order before each period is processed. Editing operations work
/// on a selected operator/parameter pair, which is how controllers find
/// their target at attach time.
pub struct Chain {
    name: String,
    muted: bool,
    bypassed: bool,
    initialized: bool,
    input: Option<Slot>,
    output: Option<Slot>,
    operators: Vec<Box<dyn Operator>>,
    controllers: Vec<ControllerBinding>,
    selected_op: Option<usize>,
    selected_param: usize,
    audioslot: SampleBuffer,
}

impl Chain {
    /// Creates an empty, unconnected chain.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            muted: false,
            bypassed: false,
            initialized: false,
            input: None,
            output: None,
            operators: Vec::new(),
            controllers: Vec::new(),
            selected_op: None,
            selected_param: 0,
            audioslot: SampleBuffer::new(1, 0, 0),
        }
    }

    /// The chain name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the chain.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Whether processing replaces the period with silence.
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Sets the mute flag.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// Whether operators are skipped (audio passes through untouched).
    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    /// Sets the bypass flag.
    pub fn set_bypassed(&mut self, bypassed: bool) {
        self.bypassed = bypassed;
    }

    /// Whether `init` has bound the chain to the current stream format.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Connects the input endpoint.
    pub fn connect_input(&mut self, slot: Slot) {
        self.input = Some(slot);
        self.initialized = false;
    }

    /// Disconnects the input endpoint.
    pub fn disconnect_input(&mut self) {
        self.input = None;
        self.initialized = false;
    }

    /// Connects the output endpoint.
    pub fn connect_output(&mut self, slot: Slot) {
        self.output = Some(slot);
        self.initialized = false;
    }

    /// Disconnects the output endpoint.
    pub fn disconnect_output(&mut self) {
        self.output = None;
        self.initialized = false;
    }

    /// The connected input slot, if any.
    pub fn input(&self) -> Option<&Slot> {
        self.input.as_ref()
    }

    /// The connected output slot, if any.
    pub fn output(&self) -> Option<&Slot> {
        self.output.as_ref()
    }

    /// Whether the chain is ready for connection: both endpoints present.
    pub fn is_valid(&self) -> bool {
        self.input.is_some() && self.output.is_some()
    }

    /// Appends an operator and selects it (first parameter selected).
    pub fn add_operator(&mut self, op: Box<dyn Operator>) {
        self.operators.push(op);
        self.selected_op = Some(self.operators.len() - 1);
        self.selected_param = 0;
        self.initialized = false;
    }

    /// Removes the selected operator along with controllers targeting it.
    pub fn remove_selected_operator(&mut self) {
        let Some(index) = self.selected_op else {
            return;
        };
        self.operators.remove(index);
        self.controllers.retain(|c| c.op_index != index);
        for binding in &mut self.controllers {
            if binding.op_index > index {
                binding.op_index -= 1;
            }
        }
        self.selected_op = None;
        self.selected_param = 0;
        self.initialized = false;
    }

    /// Selects operator `index` (0-based). Returns false if out of range.
    pub fn select_operator(&mut self, index: usize) -> bool {
        if index < self.operators.len() {
            self.selected_op = Some(index);
            self.selected_param = 0;
            true
        } else {
            false
        }
    }

    /// Index of the selected operator.
    pub fn selected_operator(&self) -> Option<usize> {
        self.selected_op
    }

    /// Selects parameter `index` of the selected operator.
    pub fn select_parameter(&mut self, index: usize) {
        self.selected_param = index;
    }

    /// Sets the selected parameter of the selected operator.
    pub fn set_parameter(&mut self, value: f32) {
        if let Some(op) = self.selected_op {
            self.operators[op].set_parameter(self.selected_param, value);
        }
    }

    /// Reads the selected parameter of the selected operator.
    pub fn parameter(&self) -> Option<f32> {
        self.selected_op
            .map(|op| self.operators[op].parameter(self.selected_param))
    }

    /// Attaches a controller to the selected operator parameter.
    ///
    /// The controller output [0, 1] is mapped onto `[low, high]`. Fails if
    /// no operator is selected.
    pub fn add_controller(
        &mut self,
        controller: Box<dyn Controller>,
        low: f32,
        high: f32,
    ) -> Result<(), EngineError> {
        let op_index = self.selected_op.ok_or(EngineError::NoControllerTarget)?;
        self.controllers.push(ControllerBinding {
            controller,
            op_index,
            param_index: self.selected_param,
            low,
            high,
        });
        Ok(())
    }

    /// Removes all operators and controllers.
    pub fn clear(&mut self) {
        self.operators.clear();
        self.controllers.clear();
        self.selected_op = None;
        self.selected_param = 0;
        self.initialized = false;
    }

    /// Number of operators in the chain.
    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }

    /// The operator list, in processing order.
    pub fn operators(&self) -> &[Box<dyn Operator>] {
        &self.operators
    }

    /// The controller bindings, in evaluation order.
    pub fn controller_bindings(&self) -> &[ControllerBinding] {
        &self.controllers
    }

    /// Binds the chain to a stream format: allocates the audioslot and
    /// initializes every operator and controller.
    ///
    /// Idempotent for an unchanged format; a format change re-initializes.
    pub fn init(&mut self, channels: usize, sample_rate: u32, buffersize: usize) {
        let same_binding = self.audioslot.channel_count() == channels
            && self.audioslot.capacity() == buffersize
            && self.audioslot.sample_rate() == sample_rate;
        if self.initialized && same_binding {
            return;
        }
        self.audioslot.resize(channels, buffersize);
        self.audioslot.set_sample_rate(sample_rate);
        for op in &mut self.operators {
            op.init(channels, sample_rate, buffersize);
        }
        for binding in &mut self.controllers {
            binding.controller.init(sample_rate, buffersize);
        }
        self.initialized = true;
    }

    /// Re-initializes all operators with the bound format.
    pub fn refresh_parameters(&mut self) {
        let channels = self.audioslot.channel_count();
        let rate = self.audioslot.sample_rate();
        let buffersize = self.audioslot.capacity();
        for op in &mut self.operators {
            op.init(channels, rate, buffersize);
        }
    }

    /// Evaluates every controller and writes the mapped values into the
    /// target parameters. Called once per period, before `process`.
    pub fn controller_update(&mut self, position_frames: u64) {
        for binding in &mut self.controllers {
            let value = binding.mapped_value(position_frames);
            if let Some(op) = self.operators.get_mut(binding.op_index) {
                op.set_parameter(binding.param_index, value);
            }
        }
    }

    /// Runs the period in the audioslot through the operator list.
    ///
    /// Muted chains deliver silence, bypassed chains deliver the input
    /// unchanged.
    pub fn process(&mut self) {
        if self.muted {
            let frames = self.audioslot.frames();
            self.audioslot.make_silent();
            self.audioslot.set_frames(frames);
            return;
        }
        if self.bypassed {
            return;
        }
        for op in &mut self.operators {
            op.process(&mut self.audioslot);
        }
    }

    /// The chain's period buffer.
    pub fn audioslot(&self) -> &SampleBuffer {
        &self.audioslot
    }

    /// The chain's period buffer, mutably.
    pub fn audioslot_mut(&mut self) -> &mut SampleBuffer {
        &mut self.audioslot
    }
}
