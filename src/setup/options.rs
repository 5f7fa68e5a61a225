//! Option interpretation and chainsetup saving.
//!
//! The supported option set:
//!
//! | Option | Effect |
//! |--------|--------|
//! | `-n:name` | chainsetup name |
//! | `-b:frames` | buffersize override |
//! | `-B:mode` | buffering mode (`auto`, `nonrt`, `rt`, `rtlowlatency`) |
//! | `-f:fmt,ch,rate[,i\|n]` | default audio format |
//! | `-a:chain1,...` / `-a:all` | add/select chains |
//! | `-i:object` | add input to selected chains |
//! | `-o:object` | add output to selected chains |
//! | `-ea:gain%` | gain operator |
//! | `-eDC:left,right` | DC-fix operator |
//! | `-kos:param,low,high,freq,phase` | sine-oscillator controller |
//! | `-z:db[,size]` / `-z:nodb` | double-buffering override |
//! | `-z:multitrack` / `-z:nomultitrack` | multitrack override |

use std::fmt::Write as _;
use std::path::Path;

use crate::buffering::BufferingMode;
use crate::chain::Slot;
use crate::error::EngineError;
use crate::format::AudioFormat;
use crate::op::{create_operator, SineOscillator};
use crate::setup::parse::{get_argument_prefix, get_arguments};
use crate::setup::Chainsetup;

impl Chainsetup {
    /// Interprets a vector of option tokens in order.
    pub fn interpret_options(&mut self, options: &[String]) -> Result<(), EngineError> {
        for option in options {
            self.interpret_option(option)?;
        }
        Ok(())
    }

    /// Interprets a single option token.
    pub fn interpret_option(&mut self, token: &str) -> Result<(), EngineError> {
        self.require(!self.enabled, "interpret_option", "a disabled chainsetup")?;
        if !token.starts_with('-') {
            return Err(EngineError::invalid_option(
                token,
                "options must begin with '-'",
            ));
        }
        let prefix = get_argument_prefix(token).to_string();
        let args = get_arguments(token);

        match prefix.as_str() {
            "n" => {
                let name = first_arg(token, &args)?;
                self.set_name(name);
            }
            "b" => {
                let frames: usize = first_arg(token, &args)?
                    .parse()
                    .map_err(|_| EngineError::invalid_option(token, "buffersize is not a number"))?;
                self.overrides.buffersize = Some(frames);
            }
            "B" => {
                self.set_buffering_mode(match first_arg(token, &args)?.as_str() {
                    "auto" => None,
                    "nonrt" => Some(BufferingMode::NonRt),
                    "rt" => Some(BufferingMode::Rt),
                    "rtlowlatency" => Some(BufferingMode::RtLowLatency),
                    _ => {
                        return Err(EngineError::invalid_option(token, "unknown buffering mode"))
                    }
                });
            }
            "f" => {
                let format = AudioFormat::parse(&args.join(","))?;
                self.set_default_format(format)?;
            }
            "a" => {
                if args.is_empty() {
                    return Err(EngineError::invalid_option(token, "no chain names"));
                }
                if args.len() == 1 && args[0] == "all" {
                    self.select_all_chains();
                } else {
                    self.add_chains(&args)?;
                    self.select_chains(&args);
                }
            }
            "i" => {
                self.add_input(&args.join(","))?;
            }
            "o" => {
                self.add_output(&args.join(","))?;
            }
            "z" => {
                self.interpret_z_option(token, &args)?;
            }
            "kos" => {
                let values = parse_f32_args(token, &args)?;
                if values.len() < 4 {
                    return Err(EngineError::invalid_option(
                        token,
                        "expected param,low,high,freq[,phase]",
                    ));
                }
                let param = values[0] as usize;
                if param < 1 {
                    return Err(EngineError::invalid_option(token, "param numbers are 1-based"));
                }
                let (low, high) = (values[1], values[2]);
                let freq = values[3];
                let phase = values.get(4).copied().unwrap_or(0.0);
                let Some(chain) = self.selected_chains_mut().next() else {
                    return Err(EngineError::NoChains);
                };
                chain.select_parameter(param - 1);
                chain.add_controller(Box::new(SineOscillator::new(freq, phase)), low, high)?;
            }
            p if p.starts_with('e') => {
                let values = parse_f32_args(token, &args)?;
                let op = create_operator(&prefix, &values)?;
                self.add_operator(op)?;
            }
            _ => {
                return Err(EngineError::invalid_option(token, "unknown option prefix"));
            }
        }
        Ok(())
    }

    fn interpret_z_option(&mut self, token: &str, args: &[String]) -> Result<(), EngineError> {
        match first_arg(token, args)?.as_str() {
            "db" => {
                self.overrides.double_buffering = Some(true);
                if let Some(size) = args.get(1) {
                    let size: usize = size.parse().map_err(|_| {
                        EngineError::invalid_option(token, "db size is not a number")
                    })?;
                    self.overrides.double_buffer_size = Some(size);
                }
            }
            "nodb" => self.overrides.double_buffering = Some(false),
            "multitrack" => self.multitrack_override = Some(true),
            "nomultitrack" => self.multitrack_override = Some(false),
            _ => {
                return Err(EngineError::invalid_option(token, "unknown -z feature"));
            }
        }
        Ok(())
    }

    /// Adds the environment's default output when inputs exist but no
    /// output was declared.
    pub fn add_default_output(&mut self) -> Result<(), EngineError> {
        if !self.inputs.is_empty() && self.outputs.is_empty() {
            self.select_all_chains();
            let default_output = self.env.default_output.clone();
            self.add_output(&default_output)?;
        }
        Ok(())
    }

    // ==================== Saving ====================

    fn general_options_string(&self) -> String {
        let mut out = format!("-b:{} -n:{}", self.buffersize(), self.name);
        let _ = write!(out, " -f:{}", self.default_format.to_spec_string());
        if let Some(mode) = self.buffering_selection {
            let _ = write!(out, " -B:{}", mode.as_str());
        }
        match self.overrides.double_buffering {
            Some(true) => {
                let _ = write!(out, " -z:db,{}", self.buffering_params().double_buffer_size);
            }
            Some(false) => out.push_str(" -z:nodb"),
            None => {}
        }
        match self.multitrack_override {
            Some(true) => out.push_str(" -z:multitrack"),
            Some(false) => out.push_str(" -z:nomultitrack"),
            None => {}
        }
        out
    }

    fn chains_attached_to(&self, table: &[Slot], index: usize, input_side: bool) -> Vec<String> {
        self.chains
            .iter()
            .filter(|chain| {
                let endpoint = if input_side {
                    chain.input()
                } else {
                    chain.output()
                };
                match (&table[index], endpoint) {
                    (Slot::Loop(id), Some(Slot::Loop(other))) => id == other,
                    (Slot::Loop(_), _) => false,
                    (_, Some(Slot::Direct(i) | Slot::Proxied { direct: i, .. })) => *i == index,
                    _ => false,
                }
            })
            .map(|chain| chain.name().to_string())
            .collect()
    }

    fn objects_string(&self, input_side: bool) -> String {
        let (table, labels) = if input_side {
            (&self.inputs, self.input_labels())
        } else {
            (&self.outputs, self.output_labels())
        };
        let mut lines = Vec::new();
        for (index, label) in labels.iter().enumerate() {
            let chains = self.chains_attached_to(table, index, input_side);
            let option = if input_side { "i" } else { "o" };
            lines.push(format!("-a:{} -{}:{}", chains.join(","), option, label));
        }
        lines.join("\n")
    }

    fn chain_operators_string(&self) -> String {
        let mut lines = Vec::new();
        for chain in &self.chains {
            if chain.operator_count() == 0 {
                continue;
            }
            let mut line = format!("-a:{}", chain.name());
            for (op_index, op) in chain.operators().iter().enumerate() {
                let params: Vec<String> = (0..op.parameter_names().len())
                    .map(|i| format_value(op.parameter(i)))
                    .collect();
                let _ = write!(line, " -{}:{}", op.prefix(), params.join(","));
                for binding in chain
                    .controller_bindings()
                    .iter()
                    .filter(|b| b.op_index == op_index)
                {
                    let _ = write!(
                        line,
                        " -{}:{},{},{},{}",
                        binding.controller.prefix(),
                        binding.param_index + 1,
                        format_value(binding.low),
                        format_value(binding.high),
                        binding.controller.argument_string()
                    );
                }
            }
            lines.push(line);
        }
        lines.join("\n")
    }

    /// Renders the chainsetup in the saved-file format.
    pub fn to_options_string(&self) -> String {
        let mut out = String::new();
        out.push_str("# chain-audio chainsetup file\n\n");
        out.push_str("# general \n");
        out.push_str(&self.general_options_string());
        out.push_str("\n\n");
        out.push_str("# audio inputs \n");
        out.push_str(&self.objects_string(true));
        out.push_str("\n\n");
        out.push_str("# audio outputs \n");
        out.push_str(&self.objects_string(false));
        out.push_str("\n\n");
        let chain_section = self.chain_operators_string();
        if !chain_section.is_empty() {
            out.push_str("# chain operators and controllers \n");
            out.push_str(&chain_section);
            out.push_str("\n\n");
        }
        out
    }

    /// Saves the chainsetup to a sectioned option file.
    pub fn save_to_file(&mut self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_options_string()).map_err(|e| EngineError::SetupFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.filename = Some(path.to_path_buf());
        Ok(())
    }
}

fn first_arg(token: &str, args: &[String]) -> Result<String, EngineError> {
    args.first()
        .cloned()
        .ok_or_else(|| EngineError::invalid_option(token, "missing argument"))
}

fn parse_f32_args(token: &str, args: &[String]) -> Result<Vec<f32>, EngineError> {
    args.iter()
        .map(|a| {
            a.parse::<f32>()
                .map_err(|_| EngineError::invalid_option(token, "argument is not a number"))
        })
        .collect()
}

/// Formats a parameter value the way option files expect (no trailing
/// zeros for integral values).
fn format_value(value: f32) -> String {
    if value.fract() == 0.0 && value.abs() < 1e9 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Environment;
    use crate::setup::parse::{escape_argument, tokenize_setup_file};

    fn opts(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_basic_option_stream() {
        let setup = Chainsetup::from_options(
            &opts(&[
                "-n:demo",
                "-b:512",
                "-f:s16_le,2,44100,i",
                "-a:left,right",
                "-i:null",
                "-o:null",
                "-a:left",
                "-ea:50",
            ]),
            Environment::default(),
        )
        .unwrap();

        assert_eq!(setup.name(), "demo");
        assert_eq!(setup.buffersize(), 512);
        assert_eq!(setup.chains().len(), 2);
        assert_eq!(setup.chain("left").unwrap().operator_count(), 1);
        assert_eq!(setup.chain("right").unwrap().operator_count(), 0);
    }

    #[test]
    fn test_default_output_added_when_missing() {
        let setup =
            Chainsetup::from_options(&opts(&["-i:null"]), Environment::default()).unwrap();
        assert_eq!(setup.output_labels(), vec!["null"]);
    }

    #[test]
    fn test_controller_option_targets_selected_parameter() {
        let setup = Chainsetup::from_options(
            &opts(&["-i:null", "-o:null", "-ea:100", "-kos:1,0,100,0.5,0.25"]),
            Environment::default(),
        )
        .unwrap();
        let chain = setup.chain("default").unwrap();
        assert_eq!(chain.controller_bindings().len(), 1);
        let binding = &chain.controller_bindings()[0];
        assert_eq!(binding.param_index, 0);
        assert_eq!(binding.low, 0.0);
        assert_eq!(binding.high, 100.0);
    }

    #[test]
    fn test_z_options_set_overrides() {
        let setup = Chainsetup::from_options(
            &opts(&["-i:null", "-o:null", "-z:db,200000", "-z:multitrack"]),
            Environment::default(),
        )
        .unwrap();
        assert_eq!(setup.overrides.double_buffering, Some(true));
        assert_eq!(setup.overrides.double_buffer_size, Some(200_000));
        assert_eq!(setup.multitrack_override, Some(true));
    }

    #[test]
    fn test_unknown_options_are_rejected() {
        let err =
            Chainsetup::from_options(&opts(&["-q:zap"]), Environment::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidOption { .. }));

        let err =
            Chainsetup::from_options(&opts(&["notanoption"]), Environment::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidOption { .. }));
    }

    #[test]
    fn test_escaped_comma_reaches_argument_values() {
        let args = get_arguments("-x:foo\\,bar,baz");
        assert_eq!(args, vec!["foo,bar", "baz"]);
        assert_eq!(escape_argument("foo,bar"), "foo\\,bar");
    }

    #[test]
    fn test_save_format_sections_and_reload() {
        let setup = Chainsetup::from_options(
            &opts(&[
                "-n:saved",
                "-b:1024",
                "-a:mix",
                "-i:null",
                "-o:null",
                "-ea:75",
                "-kos:1,0,100,2,0",
            ]),
            Environment::default(),
        )
        .unwrap();

        let text = setup.to_options_string();
        assert!(text.contains("# general "));
        assert!(text.contains("# audio inputs "));
        assert!(text.contains("# audio outputs "));
        assert!(text.contains("# chain operators and controllers "));
        assert!(text.contains("-ea:75"));
        assert!(text.contains("-kos:1,0,100,2,0"));

        // Reload through the file tokenizer.
        let tokens = tokenize_setup_file(&text);
        let reloaded = Chainsetup::from_options(&tokens, Environment::default()).unwrap();
        assert_eq!(reloaded.name(), "saved");
        assert_eq!(reloaded.buffersize(), 1024);
        assert_eq!(reloaded.chain("mix").unwrap().operator_count(), 1);
        assert_eq!(
            reloaded.chain("mix").unwrap().controller_bindings().len(),
            1
        );
    }

    #[test]
    fn test_loop_spec_round_trip() {
        let setup = Chainsetup::from_options(
            &opts(&[
                "-a:c1", "-i:null", "-o:loop,1", "-a:c2", "-i:loop,1", "-o:null",
            ]),
            Environment::default(),
        )
        .unwrap();
        let text = setup.to_options_string();
        assert!(text.contains("-o:loop,1"));
        assert!(text.contains("-i:loop,1"));

        let tokens = tokenize_setup_file(&text);
        let reloaded = Chainsetup::from_options(&tokens, Environment::default()).unwrap();
        assert_eq!(reloaded.input_labels().len(), setup.input_labels().len());
    }

    #[test]
    fn test_format_value_trims_integers() {
        assert_eq!(format_value(100.0), "100");
        assert_eq!(format_value(0.5), "0.5");
        assert_eq!(format_value(-3.0), "-3");
    }
}
