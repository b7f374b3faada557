//! Sweep configuration: how to launch the simulator, what to vary, where results go.
//!
//! A `SweepConfig` is loaded once from TOML (or taken from a built-in preset),
//! validated, and handed to the executor, driver and aggregator. Nothing reads
//! global state after that.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use nrsweep_core::aggregate::{AggregateConfig, MAX_PRECISION};
use nrsweep_core::layout::{ResultField, ResultLayout, TIMESTAMP_COLUMN};
use nrsweep_core::param::{LinkDirectionFilter, ParamError, ParamSpec, ParamValue, ParameterSpace};

/// Names accepted by `SweepConfig::preset`.
pub const PRESET_NAMES: &[&str] = &["nr-test01", "nr-test02"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("render config TOML: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid parameter table: {0}")]
    Params(#[from] ParamError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ─── Sections ───────────────────────────────────────────────────────

/// `[simulator]`: how one run is launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Shell command; `{args}` is replaced by the space-joined argument tokens
    /// (appended at the end when the placeholder is absent).
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_arg_prefix")]
    pub arg_prefix: String,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_arg_prefix() -> String {
    "--".into()
}

fn default_shell() -> String {
    "sh".into()
}

impl SimulatorConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            timeout_secs: None,
            arg_prefix: default_arg_prefix(),
            shell: default_shell(),
        }
    }
}

/// `[sweep]`: defaults for the two sweep modes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSettings {
    /// Random mode: number of trials.
    #[serde(default = "default_trials")]
    pub trials: usize,
    /// Grid mode: consecutive runs per assignment.
    #[serde(default = "default_repeats")]
    pub repeats: usize,
    /// Random mode seed; entropy when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Grid mode: parameters held constant.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fixed: BTreeMap<String, ParamValue>,
}

fn default_trials() -> usize {
    20
}

fn default_repeats() -> usize {
    1
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            trials: default_trials(),
            repeats: default_repeats(),
            seed: None,
            fixed: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutPreset {
    #[default]
    Basic,
    Extended,
}

/// `[results]`: either a named layout or an explicit field list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<LayoutPreset>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<ResultField>,
}

impl ResultsConfig {
    pub fn layout(&self) -> ResultLayout {
        if !self.fields.is_empty() {
            return ResultLayout::new(self.fields.clone());
        }
        match self.preset.unwrap_or_default() {
            LayoutPreset::Basic => ResultLayout::basic(),
            LayoutPreset::Extended => ResultLayout::extended(),
        }
    }
}

/// `[output]`: raw store and aggregated file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub results: PathBuf,
    pub aggregated: PathBuf,
}

impl OutputConfig {
    /// Raw store at `dir/sim_results.csv`, aggregate next to it.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            results: dir.join("sim_results.csv"),
            aggregated: dir.join("processed_sim_results.csv"),
        }
    }
}

// ─── Top level ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub sweep: SweepSettings,
    pub output: OutputConfig,
    #[serde(default)]
    pub results: ResultsConfig,
    #[serde(default)]
    pub aggregate: AggregateConfig,
    pub parameters: Vec<ParamSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<LinkDirectionFilter>,
}

impl SweepConfig {
    /// Load and validate a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Look up a built-in preset by name.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "nr-test01" => Some(Self::nr_test01()),
            "nr-test02" => Some(Self::nr_test02()),
            _ => None,
        }
    }

    /// Extended NR sweep over `test01.cc`: seven parameters, six results.
    ///
    /// Grid defaults hold one site at 50 W with 50000-byte uplink packets and
    /// repeat each configuration five times.
    pub fn nr_test01() -> Self {
        let mut parameters = nr_parameters();
        parameters.push(ParamSpec::int("udpPacketSizeUl", &[50, 100, 200]));

        Self {
            simulator: SimulatorConfig::new(r#"./ns3 run "contrib/nr/examples/test01.cc {args}""#),
            sweep: SweepSettings {
                repeats: 5,
                fixed: BTreeMap::from([
                    ("gNbNum".to_string(), ParamValue::Int(1)),
                    ("gnbPower".to_string(), ParamValue::Int(50)),
                    ("udpPacketSizeUl".to_string(), ParamValue::Int(50_000)),
                ]),
                ..SweepSettings::default()
            },
            output: OutputConfig::in_dir("output/202502/test01"),
            results: ResultsConfig {
                preset: Some(LayoutPreset::Extended),
                fields: Vec::new(),
            },
            aggregate: AggregateConfig::default(),
            parameters,
            filters: vec![LinkDirectionFilter::new("dlOnly", "allocate")],
        }
    }

    /// Basic NR sweep over `test02.cc`: six parameters, four results,
    /// twenty random trials by default.
    pub fn nr_test02() -> Self {
        Self {
            simulator: SimulatorConfig::new(r#"./ns3 run "contrib/nr/examples/test02.cc {args}""#),
            sweep: SweepSettings::default(),
            output: OutputConfig::in_dir("output/test01"),
            results: ResultsConfig {
                preset: Some(LayoutPreset::Basic),
                fields: Vec::new(),
            },
            aggregate: AggregateConfig::default(),
            parameters: nr_parameters(),
            filters: vec![LinkDirectionFilter::new("dlOnly", "allocate")],
        }
    }

    /// Build the validated parameter space with its filters attached.
    pub fn space(&self) -> Result<ParameterSpace, ConfigError> {
        let mut space = ParameterSpace::new(self.parameters.clone())?;
        for filter in &self.filters {
            space = space.with_filter(filter.clone());
        }
        Ok(space)
    }

    pub fn layout(&self) -> ResultLayout {
        self.results.layout()
    }

    /// Reject anything that would fail only after runs have started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simulator.command.trim().is_empty() {
            return Err(invalid("simulator.command must not be empty"));
        }
        if self.simulator.shell.trim().is_empty() {
            return Err(invalid("simulator.shell must not be empty"));
        }
        if self.simulator.timeout_secs == Some(0) {
            return Err(invalid("simulator.timeout_secs must be positive"));
        }
        if self.sweep.repeats == 0 {
            return Err(invalid("sweep.repeats must be at least 1"));
        }
        if self.results.preset.is_some() && !self.results.fields.is_empty() {
            return Err(invalid("results: set either preset or fields, not both"));
        }
        if self.aggregate.precision > MAX_PRECISION {
            return Err(invalid(format!(
                "aggregate.precision must be at most {MAX_PRECISION}"
            )));
        }
        if self.output.results == self.output.aggregated {
            return Err(invalid("output.results and output.aggregated must differ"));
        }

        let space = self.space()?;
        let layout = self.layout();
        if layout.arity() == 0 {
            return Err(invalid("results layout declares no fields"));
        }

        let mut columns = HashSet::new();
        for column in space
            .columns()
            .into_iter()
            .chain(layout.names())
        {
            if column == TIMESTAMP_COLUMN {
                return Err(invalid(format!("column name '{}' is reserved", TIMESTAMP_COLUMN)));
            }
            if !columns.insert(column) {
                return Err(invalid(format!("column '{column}' appears more than once")));
            }
        }

        for filter in &self.filters {
            for name in [&filter.downlink, &filter.allocation] {
                if space.spec(name).is_none() {
                    return Err(invalid(format!("filter references unknown parameter '{name}'")));
                }
            }
        }

        space.enumerate_all(&self.sweep.fixed)?;
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Parameters shared by both NR presets, in store column order.
fn nr_parameters() -> Vec<ParamSpec> {
    vec![
        ParamSpec::int("gNbNum", &[1, 7]),
        ParamSpec::int("ueNum", &[4, 12, 20]).with_column("UeNum"),
        ParamSpec::int("gnbPower", &[50]),
        ParamSpec::int("dlOnly", &[0, 1]),
        ParamSpec::int("allocate", &[0, 1]),
        ParamSpec::int("scheduler", &[0, 1, 2]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrsweep_core::store::header_for;

    const MINIMAL: &str = r#"
[simulator]
command = "./sim {args}"

[output]
results = "out/raw.csv"
aggregated = "out/agg.csv"

[[parameters]]
name = "a"
values = [1, 2]
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = SweepConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.simulator.arg_prefix, "--");
        assert_eq!(config.simulator.shell, "sh");
        assert_eq!(config.sweep.trials, 20);
        assert_eq!(config.sweep.repeats, 1);
        assert_eq!(config.layout(), ResultLayout::basic());
        assert_eq!(config.aggregate, AggregateConfig::default());
    }

    #[test]
    fn presets_validate() {
        for name in PRESET_NAMES {
            let config = SweepConfig::preset(name).unwrap();
            config.validate().unwrap();
        }
        assert!(SweepConfig::preset("nope").is_none());
    }

    #[test]
    fn preset_headers_match_original_layouts() {
        let basic = SweepConfig::nr_test02();
        assert_eq!(
            header_for(&basic.space().unwrap(), &basic.layout()).join(","),
            "gNbNum,UeNum,gnbPower,dlOnly,allocate,scheduler,Throughput,Delay,PacketLossRate,BLER,Timestamp"
        );

        let extended = SweepConfig::nr_test01();
        assert_eq!(
            header_for(&extended.space().unwrap(), &extended.layout()).join(","),
            "gNbNum,UeNum,gnbPower,dlOnly,allocate,scheduler,udpPacketSizeUl,Throughput,Delay,PacketLossRate,BLER,MCS,RB,Timestamp"
        );
    }

    #[test]
    fn preset_survives_toml_round_trip() {
        let config = SweepConfig::nr_test01();
        let text = config.to_toml().unwrap();
        let back = SweepConfig::from_toml(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn rejects_zero_repeats() {
        let text = format!("{MINIMAL}\n[sweep]\nrepeats = 0\n");
        assert!(matches!(
            SweepConfig::from_toml(&text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_precision_beyond_f64() {
        let text = format!("{MINIMAL}\n[aggregate]\nprecision = 400\n");
        assert!(matches!(
            SweepConfig::from_toml(&text),
            Err(ConfigError::Invalid(ref m)) if m.contains("precision")
        ));
        let text = format!("{MINIMAL}\n[aggregate]\nprecision = 15\n");
        assert!(SweepConfig::from_toml(&text).is_ok());
    }

    #[test]
    fn rejects_duplicate_parameter() {
        let text = format!("{MINIMAL}\n[[parameters]]\nname = \"a\"\nvalues = [3]\n");
        assert!(matches!(
            SweepConfig::from_toml(&text),
            Err(ConfigError::Params(ParamError::Duplicate(_)))
        ));
    }

    #[test]
    fn rejects_unknown_fixed_parameter() {
        let text = format!("{MINIMAL}\n[sweep.fixed]\nb = 1\n");
        assert!(matches!(
            SweepConfig::from_toml(&text),
            Err(ConfigError::Params(ParamError::Unknown(_)))
        ));
    }

    #[test]
    fn rejects_column_clash_with_result_field() {
        let text = MINIMAL.replace("name = \"a\"", "name = \"a\"\ncolumn = \"Delay\"");
        assert!(matches!(
            SweepConfig::from_toml(&text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_filter_on_unknown_parameter() {
        let text = format!("{MINIMAL}\n[[filters]]\ndownlink = \"dlOnly\"\nallocation = \"a\"\n");
        assert!(matches!(
            SweepConfig::from_toml(&text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn explicit_fields_override_preset_default() {
        let text = format!(
            "{MINIMAL}\n[results]\nfields = [{{ name = \"Throughput\" }}, {{ name = \"Loss\", kind = \"percent\" }}]\n"
        );
        let config = SweepConfig::from_toml(&text).unwrap();
        assert_eq!(config.layout().arity(), 2);
        assert_eq!(config.layout().names(), vec!["Throughput", "Loss"]);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = SweepConfig::from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
