//! Chainsetup: the declarative configuration and its lifecycle.
//!
//! A chainsetup aggregates chains, audio inputs and outputs, loop devices,
//! the default audio format, and the buffering parameters. Its lifecycle is
//! a small state machine: topology is edited while disabled, `enable` opens
//! and wires everything (including the proxy server when double buffering
//! applies), the engine locks the setup while ticking, and `disable` closes
//! all objects again.
//!
//! Ownership is strict: every direct audio object has exactly one owner. In
//! double-buffered mode the non-realtime objects are moved into the proxy
//! worker at enable and moved back at disable; the chainsetup's tables then
//! hold [`Slot::Proxied`] handles carrying the rings.

mod options;
pub mod parse;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::buffering::{
    select_mode, BufferingMode, BufferingOverrides, BufferingParams, Topology,
};
use crate::chain::{Chain, Slot};
use crate::env::Environment;
use crate::error::EngineError;
use crate::format::AudioFormat;
use crate::object::{AudioObject, IoMode, LoopDevice, ObjectRegistry};
use crate::proxy::{ProxyServer, RingDirection};

/// Identifies one end of the object tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Input,
    Output,
}

/// The complete declarative configuration for one processing run.
///
/// # Lifecycle
///
/// ```text
/// Editing -> enable() -> Enabled -> engine run (locked) -> Enabled
///    ^                                                        |
///    +----------------------- disable() <--------------------+
/// ```
///
/// Mutating topology (chains, inputs, outputs) requires the setup to be
/// disabled; reconfiguring operators requires it to be unlocked. Violations
/// surface as [`EngineError::InvalidState`].
impl std::fmt::Debug for Chainsetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chainsetup")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

pub struct Chainsetup {
    name: String,
    filename: Option<PathBuf>,
    env: Environment,
    registry: ObjectRegistry,

    pub(crate) chains: Vec<Chain>,
    selected_chains: Vec<String>,

    pub(crate) inputs: Vec<Slot>,
    pub(crate) outputs: Vec<Slot>,
    pub(crate) inputs_direct: Vec<Option<Box<dyn AudioObject>>>,
    pub(crate) outputs_direct: Vec<Option<Box<dyn AudioObject>>>,
    pub(crate) loops: BTreeMap<u32, LoopDevice>,

    default_format: AudioFormat,
    buffering_selection: Option<BufferingMode>,
    pub(crate) overrides: BufferingOverrides,
    active_params: BufferingParams,
    active_mode: Option<BufferingMode>,
    pub(crate) multitrack_override: Option<bool>,
    multitrack_mode: bool,

    enabled: bool,
    pub(crate) locked: bool,
    memory_locked: bool,

    pub(crate) position: u64,
    length: Option<u64>,
    length_user_set: bool,
    sample_rate: u32,

    pub(crate) pserver: Option<ProxyServer>,
    /// Registration order of proxied objects, for handing clients back.
    proxied_order: Vec<(Direction, usize)>,
}

impl Chainsetup {
    /// Creates an empty chainsetup.
    pub fn new(name: impl Into<String>, env: Environment) -> Self {
        let default_format = env.default_audio_format;
        Self {
            name: name.into(),
            filename: None,
            env,
            registry: ObjectRegistry::with_builtin_types(),
            chains: Vec::new(),
            selected_chains: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            inputs_direct: Vec::new(),
            outputs_direct: Vec::new(),
            loops: BTreeMap::new(),
            default_format,
            buffering_selection: None,
            overrides: BufferingOverrides::default(),
            active_params: BufferingParams::nonrt_defaults(),
            active_mode: None,
            multitrack_override: None,
            multitrack_mode: false,
            enabled: false,
            locked: false,
            memory_locked: false,
            position: 0,
            length: None,
            length_user_set: false,
            sample_rate: default_format.sample_rate,
            pserver: None,
            proxied_order: Vec::new(),
        }
    }

    /// Creates a chainsetup from an option vector.
    ///
    /// A `default` chain is created when the first object arrives without
    /// any `-a` selection, and if the options declare inputs but no
    /// outputs, the environment's default output is added.
    pub fn from_options(options: &[String], env: Environment) -> Result<Self, EngineError> {
        let mut setup = Self::new("command-line-setup", env);
        setup.interpret_options(options)?;
        setup.add_default_output()?;
        Ok(setup)
    }

    /// Loads a chainsetup from a file (see the file format in
    /// [`parse::tokenize_setup_file`]).
    pub fn from_file(path: impl AsRef<Path>, env: Environment) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| EngineError::SetupFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        let options = parse::tokenize_setup_file(&contents);
        let mut setup = Self::from_options(&options, env)?;
        if setup.name == "command-line-setup" {
            setup.name = path.display().to_string();
        }
        setup.filename = Some(path.to_path_buf());
        Ok(setup)
    }

    fn require(
        &self,
        condition: bool,
        operation: &'static str,
        requirement: &'static str,
    ) -> Result<(), EngineError> {
        debug_assert!(condition, "{operation} requires {requirement}");
        if condition {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                operation,
                requirement,
            })
        }
    }

    // ==================== Identity and state ====================

    /// The chainsetup name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the chainsetup.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// The file this setup was loaded from or last saved to, if any.
    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    /// Whether the chainsetup is enabled (objects open).
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the engine currently holds the setup locked.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Whether multitrack mode was active at the last mode selection.
    pub fn multitrack_mode(&self) -> bool {
        self.multitrack_mode
    }

    /// The buffering mode selected at the last `enable`.
    pub fn active_buffering_mode(&self) -> Option<BufferingMode> {
        self.active_mode
    }

    /// The default audio format applied to new objects.
    pub fn default_format(&self) -> &AudioFormat {
        &self.default_format
    }

    /// Sets the default audio format.
    pub fn set_default_format(&mut self, format: AudioFormat) -> Result<(), EngineError> {
        self.require(!self.enabled, "set_default_format", "a disabled chainsetup")?;
        self.default_format = format;
        self.sample_rate = format.sample_rate;
        Ok(())
    }

    /// Pins the buffering mode; `None` restores automatic selection.
    pub fn set_buffering_mode(&mut self, mode: Option<BufferingMode>) {
        self.buffering_selection = mode;
    }

    /// The effective buffering parameters: the active mode's tuple with
    /// user overrides applied.
    pub fn buffering_params(&self) -> BufferingParams {
        self.overrides.apply(self.active_params)
    }

    /// The effective period length in frames.
    pub fn buffersize(&self) -> usize {
        self.buffering_params().buffersize
    }

    /// The chainsetup sample rate (established at enable).
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Current position in frames.
    pub fn position_frames(&self) -> u64 {
        self.position
    }

    /// Total processing length in frames, if known.
    pub fn length_frames(&self) -> Option<u64> {
        self.length
    }

    /// Pins the processing length, overriding the derived input maximum.
    pub fn set_length_frames(&mut self, frames: u64) {
        self.length = Some(frames);
        self.length_user_set = true;
    }

    // ==================== Chains ====================

    /// Adds a `default` chain and selects it, when no chains exist yet.
    pub fn add_default_chain(&mut self) {
        if self.chains.is_empty() {
            self.chains.push(Chain::new("default"));
            self.selected_chains = vec!["default".to_string()];
        }
    }

    /// Adds chains by name, skipping names that already exist.
    pub fn add_chains(&mut self, names: &[String]) -> Result<(), EngineError> {
        self.require(!self.enabled, "add_chains", "a disabled chainsetup")?;
        for name in names {
            if !self.chains.iter().any(|c| c.name() == name) {
                self.chains.push(Chain::new(name.clone()));
            }
        }
        Ok(())
    }

    /// Sets the chain selection.
    pub fn select_chains(&mut self, names: &[String]) {
        self.selected_chains = names.to_vec();
    }

    /// Selects every chain.
    pub fn select_all_chains(&mut self) {
        self.selected_chains = self.chains.iter().map(|c| c.name().to_string()).collect();
    }

    /// The names of the currently selected chains.
    pub fn selected_chains(&self) -> &[String] {
        &self.selected_chains
    }

    /// Removes all selected chains.
    pub fn remove_selected_chains(&mut self) -> Result<(), EngineError> {
        self.require(!self.enabled, "remove_selected_chains", "a disabled chainsetup")?;
        let selected = std::mem::take(&mut self.selected_chains);
        self.chains.retain(|c| !selected.contains(&c.name().to_string()));
        Ok(())
    }

    /// Renames the first selected chain.
    pub fn rename_selected_chain(&mut self, name: &str) -> Result<(), EngineError> {
        self.require(!self.enabled, "rename_selected_chain", "a disabled chainsetup")?;
        if let Some(selected) = self.selected_chains.first() {
            if let Some(chain) = self.chains.iter_mut().find(|c| c.name() == selected) {
                chain.set_name(name);
            }
        }
        self.selected_chains = vec![name.to_string()];
        Ok(())
    }

    /// Removes all operators and controllers from the selected chains.
    pub fn clear_selected_chains(&mut self) -> Result<(), EngineError> {
        self.require(!self.locked, "clear_selected_chains", "an unlocked chainsetup")?;
        for chain in self.selected_chains_mut() {
            chain.clear();
        }
        Ok(())
    }

    /// Toggles muting on the selected chains.
    pub fn toggle_chain_muting(&mut self) -> Result<(), EngineError> {
        self.require(!self.locked, "toggle_chain_muting", "an unlocked chainsetup")?;
        for chain in self.selected_chains_mut() {
            let muted = chain.is_muted();
            chain.set_muted(!muted);
        }
        Ok(())
    }

    /// Toggles bypass on the selected chains.
    pub fn toggle_chain_bypass(&mut self) -> Result<(), EngineError> {
        self.require(!self.locked, "toggle_chain_bypass", "an unlocked chainsetup")?;
        for chain in self.selected_chains_mut() {
            let bypassed = chain.is_bypassed();
            chain.set_bypassed(!bypassed);
        }
        Ok(())
    }

    /// The chains of this setup.
    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    /// A chain by name.
    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.iter().find(|c| c.name() == name)
    }

    /// A chain by name, mutably.
    pub fn chain_mut(&mut self, name: &str) -> Option<&mut Chain> {
        self.chains.iter_mut().find(|c| c.name() == name)
    }

    fn selected_chains_mut(&mut self) -> impl Iterator<Item = &mut Chain> {
        let selected = self.selected_chains.clone();
        self.chains
            .iter_mut()
            .filter(move |c| selected.contains(&c.name().to_string()))
    }

    /// Appends an operator to the first selected chain and selects it.
    pub fn add_operator(&mut self, op: Box<dyn crate::op::Operator>) -> Result<(), EngineError> {
        self.require(!self.locked, "add_operator", "an unlocked chainsetup")?;
        let Some(chain) = self.selected_chains_mut().next() else {
            return Err(EngineError::NoChains);
        };
        chain.add_operator(op);
        Ok(())
    }

    /// Attaches a controller to the selected operator parameter of the
    /// first selected chain.
    pub fn add_controller(
        &mut self,
        controller: Box<dyn crate::op::Controller>,
        low: f32,
        high: f32,
    ) -> Result<(), EngineError> {
        self.require(!self.locked, "add_controller", "an unlocked chainsetup")?;
        let Some(chain) = self.selected_chains_mut().next() else {
            return Err(EngineError::NoChains);
        };
        chain.add_controller(controller, low, high)
    }

    // ==================== Objects ====================

    /// Adds an input object from a specification string and attaches it to
    /// the selected chains.
    pub fn add_input(&mut self, spec: &str) -> Result<(), EngineError> {
        self.require(!self.enabled, "add_input", "a disabled chainsetup")?;
        self.add_default_chain();
        if let Some(loop_id) = parse_loop_spec(spec) {
            return self.add_loop(Direction::Input, loop_id);
        }
        let object = self.registry.create(spec)?;
        self.add_object(Direction::Input, object)
    }

    /// Adds an already-constructed input object.
    pub fn add_input_object(
        &mut self,
        object: Box<dyn AudioObject>,
    ) -> Result<(), EngineError> {
        self.require(!self.enabled, "add_input_object", "a disabled chainsetup")?;
        self.add_default_chain();
        self.add_object(Direction::Input, object)
    }

    /// Adds an output object from a specification string and attaches it to
    /// the selected chains.
    pub fn add_output(&mut self, spec: &str) -> Result<(), EngineError> {
        self.require(!self.enabled, "add_output", "a disabled chainsetup")?;
        self.add_default_chain();
        if let Some(loop_id) = parse_loop_spec(spec) {
            return self.add_loop(Direction::Output, loop_id);
        }
        let object = self.registry.create(spec)?;
        self.add_object(Direction::Output, object)
    }

    /// Adds an already-constructed output object.
    pub fn add_output_object(
        &mut self,
        object: Box<dyn AudioObject>,
    ) -> Result<(), EngineError> {
        self.require(!self.enabled, "add_output_object", "a disabled chainsetup")?;
        self.add_default_chain();
        self.add_object(Direction::Output, object)
    }

    fn add_object(
        &mut self,
        direction: Direction,
        mut object: Box<dyn AudioObject>,
    ) -> Result<(), EngineError> {
        object.set_io_mode(match direction {
            Direction::Input => IoMode::Read,
            Direction::Output => IoMode::Write,
        });
        object.set_format(self.default_format)?;
        object.set_buffersize(self.buffersize());
        tracing::info!(
            label = object.label(),
            ?direction,
            "audio object added to chainsetup"
        );

        let (slots, directs) = match direction {
            Direction::Input => (&mut self.inputs, &mut self.inputs_direct),
            Direction::Output => (&mut self.outputs, &mut self.outputs_direct),
        };
        let index = slots.len();
        slots.push(Slot::Direct(index));
        directs.push(Some(object));
        self.attach_to_selected_chains(direction, Slot::Direct(index));
        Ok(())
    }

    fn add_loop(&mut self, direction: Direction, loop_id: u32) -> Result<(), EngineError> {
        if !self.loops.contains_key(&loop_id) {
            let mut device = LoopDevice::new(loop_id);
            device.set_format(self.default_format)?;
            device.set_buffersize(self.buffersize());
            self.loops.insert(loop_id, device);
        }
        let (slots, directs) = match direction {
            Direction::Input => (&mut self.inputs, &mut self.inputs_direct),
            Direction::Output => (&mut self.outputs, &mut self.outputs_direct),
        };
        slots.push(Slot::Loop(loop_id));
        directs.push(None);
        self.attach_to_selected_chains(direction, Slot::Loop(loop_id));
        Ok(())
    }

    fn attach_to_selected_chains(&mut self, direction: Direction, slot: Slot) {
        let selected = self.selected_chains.clone();
        for chain in self
            .chains
            .iter_mut()
            .filter(|c| selected.contains(&c.name().to_string()))
        {
            match direction {
                Direction::Input => chain.connect_input(slot.clone()),
                Direction::Output => chain.connect_output(slot.clone()),
            }
        }
    }

    /// Removes the input with the given label, detaching affected chains.
    pub fn remove_audio_input(&mut self, label: &str) -> Result<(), EngineError> {
        self.require(!self.enabled, "remove_audio_input", "a disabled chainsetup")?;
        for index in 0..self.inputs.len() {
            let matches = self.inputs_direct[index]
                .as_deref()
                .is_some_and(|o| o.label() == label);
            if matches {
                for chain in &mut self.chains {
                    if slot_points_at(chain.input(), index) {
                        chain.disconnect_input();
                    }
                }
                self.inputs_direct[index] = None;
                tracing::info!(label, "input removed");
            }
        }
        Ok(())
    }

    /// Removes the output with the given label, detaching affected chains.
    pub fn remove_audio_output(&mut self, label: &str) -> Result<(), EngineError> {
        self.require(!self.enabled, "remove_audio_output", "a disabled chainsetup")?;
        for index in 0..self.outputs.len() {
            let matches = self.outputs_direct[index]
                .as_deref()
                .is_some_and(|o| o.label() == label);
            if matches {
                for chain in &mut self.chains {
                    if slot_points_at(chain.output(), index) {
                        chain.disconnect_output();
                    }
                }
                self.outputs_direct[index] = None;
                tracing::info!(label, "output removed");
            }
        }
        Ok(())
    }

    /// Labels of all inputs, in table order.
    pub fn input_labels(&self) -> Vec<String> {
        self.table_labels(&self.inputs, &self.inputs_direct)
    }

    /// Labels of all outputs, in table order.
    pub fn output_labels(&self) -> Vec<String> {
        self.table_labels(&self.outputs, &self.outputs_direct)
    }

    fn table_labels(
        &self,
        slots: &[Slot],
        directs: &[Option<Box<dyn AudioObject>>],
    ) -> Vec<String> {
        slots
            .iter()
            .enumerate()
            .map(|(i, slot)| match slot {
                Slot::Loop(id) => format!("loop,{id}"),
                _ => directs[i]
                    .as_deref()
                    .map_or_else(|| "(proxied)".to_string(), |o| o.label().to_string()),
            })
            .collect()
    }

    /// Whether the input at `index` runs behind the proxy server.
    pub fn input_is_proxied(&self, index: usize) -> bool {
        matches!(self.inputs.get(index), Some(Slot::Proxied { .. }))
    }

    /// Whether the output at `index` runs behind the proxy server.
    pub fn output_is_proxied(&self, index: usize) -> bool {
        matches!(self.outputs.get(index), Some(Slot::Proxied { .. }))
    }

    // ==================== Topology counts ====================

    fn count_realtime(&self, directs: &[Option<Box<dyn AudioObject>>]) -> usize {
        directs
            .iter()
            .filter(|o| o.as_deref().is_some_and(|o| o.caps().realtime))
            .count()
    }

    /// Number of realtime inputs.
    pub fn realtime_inputs(&self) -> usize {
        self.count_realtime(&self.inputs_direct)
    }

    /// Number of realtime outputs.
    pub fn realtime_outputs(&self) -> usize {
        self.count_realtime(&self.outputs_direct)
    }

    /// Total chain operators across all chains.
    pub fn chain_operator_count(&self) -> usize {
        self.chains.iter().map(|c| c.operator_count()).sum()
    }

    fn topology(&self) -> Topology {
        let rti = self.realtime_inputs();
        let rto = self.realtime_outputs();
        Topology {
            realtime_inputs: rti,
            realtime_outputs: rto,
            nonrt_inputs: self.inputs.len() - rti,
            nonrt_outputs: self.outputs.len() - rto,
            chain_operators: self.chain_operator_count(),
            chains: self.chains.len(),
            rt_capable: self.env.rt_capable,
            multitrack_override: self.multitrack_override,
        }
    }

    /// Whether the setup can be enabled: nonempty tables and every chain
    /// fully connected.
    pub fn is_valid_for_connection(&self) -> Result<(), EngineError> {
        if self.inputs.is_empty() {
            return Err(EngineError::NoInputs);
        }
        if self.outputs.is_empty() {
            return Err(EngineError::NoOutputs);
        }
        if self.chains.is_empty() {
            return Err(EngineError::NoChains);
        }
        for chain in &self.chains {
            if !chain.is_valid() {
                return Err(EngineError::ChainNotConnected {
                    chain: chain.name().to_string(),
                });
            }
        }
        Ok(())
    }

    // ==================== Lifecycle ====================

    /// Selects the buffering mode and opens every object.
    ///
    /// On any open or format error the transition unwinds: everything
    /// already opened is closed again and the setup stays disabled.
    pub fn enable(&mut self) -> Result<(), EngineError> {
        self.require(!self.locked, "enable", "an unlocked chainsetup")?;
        if self.enabled {
            return Ok(());
        }
        self.is_valid_for_connection()?;

        // 1. Buffering mode.
        let decision = select_mode(&self.topology());
        self.multitrack_mode = decision.multitrack;
        let mode = self.buffering_selection.unwrap_or(decision.mode);
        self.active_mode = Some(mode);
        self.active_params = BufferingParams::defaults_for(mode);
        if decision.drop_priority {
            self.active_params.raised_priority = false;
            self.overrides.raised_priority = Some(false);
        }
        let params = self.buffering_params();
        tracing::info!(
            mode = mode.as_str(),
            multitrack = self.multitrack_mode,
            buffersize = params.buffersize,
            "buffering mode selected"
        );

        // 2. Memory locking, best effort.
        if params.raised_priority {
            self.memory_locked = lock_all_memory();
        }

        if let Err(e) = self.open_objects(params.buffersize) {
            self.unwind_enable();
            return Err(e);
        }

        // 6. Processing length.
        if !self.length_user_set {
            let max_input = self
                .inputs_direct
                .iter()
                .flatten()
                .filter_map(|o| o.length())
                .max();
            self.length = max_input;
        }

        // 7. Proxy wiring.
        let has_rt = self.realtime_inputs() > 0 || self.realtime_outputs() > 0;
        let has_nonrt =
            self.inputs.len() + self.outputs.len() > self.realtime_inputs() + self.realtime_outputs();
        if params.double_buffering && has_rt && has_nonrt {
            if let Err(e) = self.wire_proxies(&params) {
                self.unwind_enable();
                return Err(e);
            }
        }

        // Chains pick up the (possibly proxied) slots and bind the format.
        self.rebind_chain_slots();
        let channels = self.default_format.channels;
        let rate = self.sample_rate;
        for chain in &mut self.chains {
            chain.init(channels, rate, params.buffersize);
        }

        self.enabled = true;
        tracing::info!(name = %self.name, rate = self.sample_rate, "chainsetup enabled");
        Ok(())
    }

    /// Reverts a partially performed `enable`: closes whatever opened and
    /// releases the memory lock. The setup stays in the editing state.
    fn unwind_enable(&mut self) {
        self.close_all_objects();
        if self.memory_locked {
            unlock_all_memory();
            self.memory_locked = false;
        }
    }

    /// Steps 3-5: open inputs, establish the common rate, open outputs.
    fn open_objects(&mut self, buffersize: usize) -> Result<(), EngineError> {
        let default_format = self.default_format;

        for device in self.loops.values_mut() {
            device.set_buffersize(buffersize);
            device.open()?;
        }

        let mut engine_rate: Option<u32> = None;
        for object in self.inputs_direct.iter_mut().flatten() {
            object.set_buffersize(buffersize);
            if !object.is_open() {
                object.set_format(default_format)?;
                object.open()?;
            }
            let rate = object.format().sample_rate;
            match engine_rate {
                None => engine_rate = Some(rate),
                Some(first) if first != rate => {
                    return Err(EngineError::SampleRateMismatch {
                        label: object.label().to_string(),
                        object_rate: rate,
                        engine_rate: first,
                    });
                }
                Some(_) => {}
            }
        }
        if let Some(rate) = engine_rate {
            self.sample_rate = rate;
        }
        for device in self.loops.values_mut() {
            let mut format = *device.format();
            format.sample_rate = self.sample_rate;
            device.set_format(format)?;
        }

        let mut output_format = default_format;
        output_format.sample_rate = self.sample_rate;
        for object in self.outputs_direct.iter_mut().flatten() {
            object.set_buffersize(buffersize);
            if !object.is_open() {
                object.set_format(output_format)?;
                object.open()?;
            }
            let rate = object.format().sample_rate;
            if rate != self.sample_rate {
                return Err(EngineError::SampleRateMismatch {
                    label: object.label().to_string(),
                    object_rate: rate,
                    engine_rate: self.sample_rate,
                });
            }
        }
        Ok(())
    }

    /// Moves every non-realtime, non-loop object into the proxy server.
    fn wire_proxies(&mut self, params: &BufferingParams) -> Result<(), EngineError> {
        let mut server = ProxyServer::new()?;
        let slots = (params.double_buffer_size / params.buffersize)
            .max(crate::proxy::DEFAULT_SLOTS)
            .min(1024);
        let channels = self.default_format.channels;
        let rate = self.sample_rate;
        self.proxied_order.clear();

        for index in 0..self.inputs.len() {
            let proxy_it = self.inputs_direct[index]
                .as_deref()
                .is_some_and(|o| !o.caps().realtime);
            if proxy_it {
                let object = self.inputs_direct[index].take().expect("object present");
                let ring = server.register_client(
                    object,
                    RingDirection::Read,
                    slots,
                    channels,
                    params.buffersize,
                    rate,
                );
                self.inputs[index] = Slot::Proxied {
                    direct: index,
                    ring,
                };
                self.proxied_order.push((Direction::Input, index));
            }
        }
        for index in 0..self.outputs.len() {
            let proxy_it = self.outputs_direct[index]
                .as_deref()
                .is_some_and(|o| !o.caps().realtime);
            if proxy_it {
                let object = self.outputs_direct[index].take().expect("object present");
                let ring = server.register_client(
                    object,
                    RingDirection::Write,
                    slots,
                    channels,
                    params.buffersize,
                    rate,
                );
                self.outputs[index] = Slot::Proxied {
                    direct: index,
                    ring,
                };
                self.proxied_order.push((Direction::Output, index));
            }
        }

        server.start();
        self.pserver = Some(server);
        Ok(())
    }

    /// Refreshes the slot copies held by chains from the current tables.
    fn rebind_chain_slots(&mut self) {
        for chain in &mut self.chains {
            if let Some(slot) = chain.input() {
                let refreshed = match slot {
                    Slot::Direct(i) | Slot::Proxied { direct: i, .. } => {
                        Some(self.inputs[*i].clone())
                    }
                    Slot::Loop(_) => None,
                };
                if let Some(slot) = refreshed {
                    chain.connect_input(slot);
                }
            }
            if let Some(slot) = chain.output() {
                let refreshed = match slot {
                    Slot::Direct(i) | Slot::Proxied { direct: i, .. } => {
                        Some(self.outputs[*i].clone())
                    }
                    Slot::Loop(_) => None,
                };
                if let Some(slot) = refreshed {
                    chain.connect_output(slot);
                }
            }
        }
    }

    /// Closes every object and tears the proxy server down.
    pub fn disable(&mut self) -> Result<(), EngineError> {
        self.require(!self.locked, "disable", "an unlocked chainsetup")?;
        if !self.enabled {
            return Ok(());
        }
        tracing::info!(name = %self.name, "disabling chainsetup");

        if let Some(mut server) = self.pserver.take() {
            server.stop();
            let clients = server.take_clients();
            drop(server);
            for ((direction, index), client) in
                std::mem::take(&mut self.proxied_order).into_iter().zip(clients)
            {
                let (slots, directs) = match direction {
                    Direction::Input => (&mut self.inputs, &mut self.inputs_direct),
                    Direction::Output => (&mut self.outputs, &mut self.outputs_direct),
                };
                slots[index] = Slot::Direct(index);
                directs[index] = Some(client);
            }
        }

        self.close_all_objects();
        self.rebind_chain_slots();

        if self.memory_locked {
            unlock_all_memory();
            self.memory_locked = false;
        }
        self.enabled = false;
        Ok(())
    }

    fn close_all_objects(&mut self) {
        for object in self.inputs_direct.iter_mut().flatten() {
            if object.is_open() {
                tracing::debug!(label = object.label(), "closing input");
                object.close();
            }
        }
        for object in self.outputs_direct.iter_mut().flatten() {
            if object.is_open() {
                tracing::debug!(label = object.label(), "closing output");
                object.close();
            }
        }
        for device in self.loops.values_mut() {
            device.close();
        }
    }

    /// Repositions the whole chainsetup to `frames`.
    ///
    /// Pending proxy data is discarded first, then every object is seeked
    /// and finished flags cleared.
    pub fn seek(&mut self, frames: u64) -> Result<(), EngineError> {
        self.require(!self.locked, "seek", "an unlocked chainsetup")?;
        self.seek_unchecked(frames);
        Ok(())
    }

    /// Seek used by the engine at a period boundary, bypassing the lock
    /// check (the engine owns the lock).
    pub(crate) fn seek_unchecked(&mut self, frames: u64) {
        tracing::debug!(frames, "seeking chainsetup");
        if let Some(server) = &self.pserver {
            let was_running = server.is_running();
            if was_running {
                server.stop();
            }
            server.seek_all(frames);
            if was_running {
                server.start();
            }
        }
        for object in self.inputs_direct.iter_mut().flatten() {
            object.seek(frames);
        }
        for object in self.outputs_direct.iter_mut().flatten() {
            object.seek(frames);
        }
        for device in self.loops.values_mut() {
            device.seek(frames);
        }
        self.position = frames;
    }
}

impl Drop for Chainsetup {
    fn drop(&mut self) {
        if self.enabled && !self.locked {
            let _ = self.disable();
        }
    }
}

fn slot_points_at(slot: Option<&Slot>, index: usize) -> bool {
    matches!(
        slot,
        Some(Slot::Direct(i) | Slot::Proxied { direct: i, .. }) if *i == index
    )
}

/// Parses a `loop,<id>` specification.
fn parse_loop_spec(spec: &str) -> Option<u32> {
    let rest = spec.strip_prefix("loop,")?;
    rest.parse().ok()
}

#[cfg(unix)]
fn lock_all_memory() -> bool {
    // Best effort; requires privileges on most systems.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret == 0 {
        tracing::debug!("process memory locked");
        true
    } else {
        tracing::warn!("could not lock process memory");
        false
    }
}

#[cfg(not(unix))]
fn lock_all_memory() -> bool {
    tracing::warn!("memory locking not available on this platform");
    false
}

#[cfg(unix)]
fn unlock_all_memory() {
    unsafe {
        libc::munlockall();
    }
}

#[cfg(not(unix))]
fn unlock_all_memory() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MockDevice;
    use std::sync::atomic::Ordering;

    fn env() -> Environment {
        Environment::default()
    }

    #[test]
    fn test_enable_requires_complete_topology() {
        let mut setup = Chainsetup::new("t", env());
        assert!(matches!(setup.enable(), Err(EngineError::NoInputs)));

        setup.add_input("null").unwrap();
        assert!(matches!(setup.enable(), Err(EngineError::NoOutputs)));

        setup.add_output("null").unwrap();
        setup.enable().unwrap();
        assert!(setup.is_enabled());
        setup.disable().unwrap();
    }

    #[test]
    fn test_enable_is_idempotent() {
        let mut setup = Chainsetup::new("t", env());
        setup.add_input("null").unwrap();
        setup.add_output("null").unwrap();
        setup.enable().unwrap();
        setup.enable().unwrap();
        assert!(setup.is_enabled());
        setup.disable().unwrap();
        assert!(!setup.is_enabled());
    }

    #[test]
    fn test_open_failure_unwinds_enable() {
        let mut setup = Chainsetup::new("t", env());
        let good = MockDevice::source("good", 100);
        let good_stats = good.stats();
        setup.add_input_object(Box::new(good)).unwrap();
        setup
            .add_input_object(Box::new(MockDevice::source("bad", 100).with_open_failure()))
            .unwrap();
        setup.add_output("null").unwrap();

        assert!(matches!(setup.enable(), Err(EngineError::ObjectOpen { .. })));
        assert!(!setup.is_enabled());
        // The object that did open was closed during unwind.
        assert!(!good_stats.is_open.load(Ordering::SeqCst));
    }

    #[test]
    fn test_rate_mismatch_fails_enable_naming_both_rates() {
        let mut setup = Chainsetup::new("t", env());
        setup
            .add_input_object(Box::new(MockDevice::source("a", 10)))
            .unwrap();
        setup
            .add_input_object(Box::new(
                MockDevice::source("b", 10).with_sample_rate(48000),
            ))
            .unwrap();
        setup.add_output("null").unwrap();

        match setup.enable() {
            Err(EngineError::SampleRateMismatch {
                label,
                object_rate,
                engine_rate,
            }) => {
                assert_eq!(label, "b");
                assert_eq!(object_rate, 48000);
                assert_eq!(engine_rate, 44100);
            }
            other => panic!("expected rate mismatch, got {other:?}"),
        }
        assert!(!setup.is_enabled());
    }

    #[test]
    fn test_disable_closes_every_object() {
        let mut setup = Chainsetup::new("t", env());
        let input = MockDevice::source("in", 100);
        let output = MockDevice::sink("out");
        let in_stats = input.stats();
        let out_stats = output.stats();
        setup.add_input_object(Box::new(input)).unwrap();
        setup.add_output_object(Box::new(output)).unwrap();

        setup.enable().unwrap();
        assert!(in_stats.is_open.load(Ordering::SeqCst));
        assert!(out_stats.is_open.load(Ordering::SeqCst));

        setup.disable().unwrap();
        assert!(!in_stats.is_open.load(Ordering::SeqCst));
        assert!(!out_stats.is_open.load(Ordering::SeqCst));
    }

    #[test]
    fn test_mutating_topology_while_enabled_is_rejected() {
        let mut setup = Chainsetup::new("t", env());
        setup.add_input("null").unwrap();
        setup.add_output("null").unwrap();
        setup.enable().unwrap();

        // Release builds surface the violation as an error.
        if cfg!(debug_assertions) {
            let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let _ = setup.add_input("null");
            }));
            assert!(caught.is_err());
        } else {
            assert!(matches!(
                setup.add_input("null"),
                Err(EngineError::InvalidState { .. })
            ));
        }
        setup.disable().unwrap();
    }

    #[test]
    fn test_length_derived_from_longest_input() {
        let mut setup = Chainsetup::new("t", env());
        setup
            .add_input_object(Box::new(MockDevice::source("a", 500)))
            .unwrap();
        setup
            .add_input_object(Box::new(MockDevice::source("b", 900)))
            .unwrap();
        setup.add_output("null").unwrap();
        setup.enable().unwrap();
        assert_eq!(setup.length_frames(), Some(900));
        setup.disable().unwrap();
    }

    #[test]
    fn test_user_length_wins() {
        let mut setup = Chainsetup::new("t", env());
        setup
            .add_input_object(Box::new(MockDevice::source("a", 500)))
            .unwrap();
        setup.add_output("null").unwrap();
        setup.set_length_frames(44100);
        setup.enable().unwrap();
        assert_eq!(setup.length_frames(), Some(44100));
        setup.disable().unwrap();
    }

    #[test]
    fn test_mixed_topology_wires_proxies() {
        let mut setup = Chainsetup::new("t", env());
        setup.add_chains(&["c1".to_string(), "c2".to_string()]).unwrap();
        setup.select_chains(&["c1".to_string()]);
        setup
            .add_input_object(Box::new(MockDevice::source("rt-in", 1000).realtime()))
            .unwrap();
        setup.add_output("null").unwrap();
        setup.select_chains(&["c2".to_string()]);
        setup
            .add_input_object(Box::new(MockDevice::source("file-in", 1000)))
            .unwrap();
        setup
            .add_output_object(Box::new(MockDevice::sink("rt-out").realtime()))
            .unwrap();

        setup.enable().unwrap();
        assert!(setup.multitrack_mode());
        assert_eq!(setup.active_buffering_mode(), Some(BufferingMode::Rt));
        // The non-rt objects are proxied, the rt ones stay direct.
        assert!(!setup.input_is_proxied(0));
        assert!(setup.output_is_proxied(0));
        assert!(setup.input_is_proxied(1));
        assert!(!setup.output_is_proxied(1));
        assert!(setup.pserver.is_some());

        setup.disable().unwrap();
        // Clients returned and unwrapped.
        assert!(!setup.input_is_proxied(1));
        assert!(setup.pserver.is_none());
    }

    #[test]
    fn test_nonrt_only_topology_stays_direct() {
        let mut setup = Chainsetup::new("t", env());
        setup
            .add_input_object(Box::new(MockDevice::source("file-in", 100)))
            .unwrap();
        setup.add_output("null").unwrap();
        setup.enable().unwrap();
        assert_eq!(setup.active_buffering_mode(), Some(BufferingMode::NonRt));
        assert!(!setup.input_is_proxied(0));
        assert!(setup.pserver.is_none());
        setup.disable().unwrap();
    }

    #[test]
    fn test_loop_device_shared_between_tables() {
        let mut setup = Chainsetup::new("t", env());
        setup.add_chains(&["c1".to_string(), "c2".to_string()]).unwrap();
        setup.select_chains(&["c1".to_string()]);
        setup
            .add_input_object(Box::new(MockDevice::source("in", 100)))
            .unwrap();
        setup.add_output("loop,1").unwrap();
        setup.select_chains(&["c2".to_string()]);
        setup.add_input("loop,1").unwrap();
        setup.add_output("null").unwrap();

        assert_eq!(setup.loops.len(), 1);
        assert_eq!(setup.input_labels()[1], "loop,1");
        assert_eq!(setup.output_labels()[0], "loop,1");

        setup.enable().unwrap();
        setup.disable().unwrap();
        assert_eq!(setup.loops.len(), 1);
    }

    #[test]
    fn test_chain_editing_through_setup() {
        let mut setup = Chainsetup::new("t", env());
        setup.add_default_chain();
        setup
            .add_operator(Box::new(crate::op::Gain::new(50.0)))
            .unwrap();
        assert_eq!(setup.chain_operator_count(), 1);
        setup
            .add_controller(Box::new(crate::op::SineOscillator::new(0.5, 0.0)), 0.0, 100.0)
            .unwrap();
        assert_eq!(
            setup.chain("default").unwrap().controller_bindings().len(),
            1
        );
        setup.toggle_chain_muting().unwrap();
        assert!(setup.chain("default").unwrap().is_muted());
        setup.clear_selected_chains().unwrap();
        assert_eq!(setup.chain_operator_count(), 0);
    }

    #[test]
    fn test_remove_input_detaches_chains() {
        let mut setup = Chainsetup::new("t", env());
        setup
            .add_input_object(Box::new(MockDevice::source("in", 10)))
            .unwrap();
        setup.add_output("null").unwrap();
        assert!(setup.chain("default").unwrap().is_valid());
        setup.remove_audio_input("in").unwrap();
        assert!(!setup.chain("default").unwrap().is_valid());
    }
}
