use std::convert::TryFrom;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use yaml_rust::Yaml;
use yaml_rust::YamlLoader;

use super::errors::TrafficError;


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Classical,
    QuantumStyle,
    Exhaustive,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Classical => "classical",
            Backend::QuantumStyle => "quantum_style",
            Backend::Exhaustive => "exhaustive",
        }
    }
}

impl FromStr for Backend {
    type Err = TrafficError;

    fn from_str(ss: &str) -> Result<Backend, TrafficError> {
        match ss {
            "classical" => Ok(Backend::Classical),
            "quantum_style" | "quantumStyle" => Ok(Backend::QuantumStyle),
            "exhaustive" => Ok(Backend::Exhaustive),
            _ => Err(TrafficError::InvalidConfig(format!("unknown backend '{}'", ss))),
        }
    }
}

/// How the path objective accounts for vehicles sharing a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CongestionModel {
    /// Quadratic: solo costs plus a pairwise surcharge for every two vehicles sharing a
    /// segment.  Exact while no segment carries more than two vehicles.
    Pairwise,
    /// One term per segment over every vehicle that might use it.  Not quadratic.
    Exact,
}

impl FromStr for CongestionModel {
    type Err = TrafficError;

    fn from_str(ss: &str) -> Result<CongestionModel, TrafficError> {
        match ss {
            "pairwise" => Ok(CongestionModel::Pairwise),
            "exact" => Ok(CongestionModel::Exact),
            _ => Err(TrafficError::InvalidConfig(format!("unknown congestion model '{}'", ss))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SignalConfig {
    pub cycle_length_s: u32,
    // phase durations are whole multiples of this
    pub green_unit_s: u32,
    pub min_green_s: u32,
    pub max_green_s: u32,
    pub emergency_clearance_s: f64,
}

impl Default for SignalConfig {
    fn default() -> SignalConfig {
        SignalConfig {
            cycle_length_s: 90,
            green_unit_s: 5,
            min_green_s: 10,
            max_green_s: 60,
            emergency_clearance_s: 10.,
        }
    }
}

impl SignalConfig {
    fn from_yaml(yaml_cfg: &Yaml) -> Result<SignalConfig, TrafficError> {
        let default = SignalConfig::default();
        Ok(SignalConfig {
            cycle_length_s: read_u32(yaml_cfg, "cycle_length_s", default.cycle_length_s)?,
            green_unit_s: read_u32(yaml_cfg, "green_unit_s", default.green_unit_s)?,
            min_green_s: read_u32(yaml_cfg, "min_green_s", default.min_green_s)?,
            max_green_s: read_u32(yaml_cfg, "max_green_s", default.max_green_s)?,
            emergency_clearance_s: read_f64(yaml_cfg, "emergency_clearance_s",
                                            default.emergency_clearance_s)?,
        })
    }

    pub fn validate(&self) -> Result<(), TrafficError> {
        let unit = self.green_unit_s;
        if unit == 0 || self.cycle_length_s == 0 || self.min_green_s == 0 {
            return Err(TrafficError::InvalidConfig(
                String::from("cycle length, green unit and minimum green must be positive")));
        }
        for (name, value) in &[("cycle_length_s", self.cycle_length_s),
                               ("min_green_s", self.min_green_s),
                               ("max_green_s", self.max_green_s)] {
            if value % unit != 0 {
                return Err(TrafficError::InvalidConfig(
                    format!("{} = {} is not a multiple of green_unit_s = {}", name, value, unit)));
            }
        }
        if self.max_green_s < self.min_green_s {
            return Err(TrafficError::InvalidConfig(
                String::from("max_green_s must be at least min_green_s")));
        }
        if !(self.emergency_clearance_s >= 0.) ||
           self.emergency_clearance_s > self.max_green_s as f64 {
            return Err(TrafficError::InvalidConfig(
                String::from("emergency_clearance_s must lie in [0, max_green_s]")));
        }
        Ok(())
    }

    pub fn buckets(&self, seconds: u32) -> usize {
        (seconds / self.green_unit_s) as usize
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub backend: Backend,
    pub max_iterations: u64,
    pub time_budget_s: f64,
    pub random_seed: u64,
    // k in k-shortest paths
    pub candidate_path_bound: usize,
    pub max_hops: usize,
    pub congestion_model: CongestionModel,
    // quantum-style backend only
    pub num_reads: usize,
    pub max_qubo_bits: usize,
    // exhaustive backend only
    pub max_exhaustive_states: u64,
    pub parallel: bool,
    pub signal: SignalConfig,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            backend: Backend::Classical,
            max_iterations: 20_000,
            time_budget_s: 10.,
            random_seed: 100,
            candidate_path_bound: 4,
            max_hops: 32,
            congestion_model: CongestionModel::Pairwise,
            num_reads: 16,
            max_qubo_bits: 1024,
            max_exhaustive_states: 1_000_000,
            parallel: true,
            signal: SignalConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reads a config, falling back to the default for each key that is absent.  A key that
    /// is present with the wrong type is an error, not a default.
    pub fn from_yaml(yaml_cfg: &Yaml) -> Result<EngineConfig, TrafficError> {
        let default = EngineConfig::default();
        let backend = match read_str(yaml_cfg, "backend")? {
            Some(name) => name.parse()?,
            None => default.backend,
        };
        let congestion_model = match read_str(yaml_cfg, "congestion_model")? {
            Some(name) => name.parse()?,
            None => default.congestion_model,
        };
        let signal = if yaml_cfg["signal"].is_badvalue() {
            default.signal.clone()
        } else {
            SignalConfig::from_yaml(&yaml_cfg["signal"])?
        };

        let cfg = EngineConfig {
            backend,
            max_iterations: read_u64(yaml_cfg, "max_iterations", default.max_iterations)?,
            time_budget_s: read_f64(yaml_cfg, "time_budget_s", default.time_budget_s)?,
            random_seed: read_u64(yaml_cfg, "random_seed", default.random_seed)?,
            candidate_path_bound: read_u64(yaml_cfg, "candidate_path_bound",
                                           default.candidate_path_bound as u64)? as usize,
            max_hops: read_u64(yaml_cfg, "max_hops", default.max_hops as u64)? as usize,
            congestion_model,
            num_reads: read_u64(yaml_cfg, "num_reads", default.num_reads as u64)? as usize,
            max_qubo_bits: read_u64(yaml_cfg, "max_qubo_bits", default.max_qubo_bits as u64)?
                as usize,
            max_exhaustive_states: read_u64(yaml_cfg, "max_exhaustive_states",
                                            default.max_exhaustive_states)?,
            parallel: read_bool(yaml_cfg, "parallel", default.parallel)?,
            signal,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_str(contents: &str) -> Result<EngineConfig, TrafficError> {
        let docs = YamlLoader::load_from_str(contents).map_err(|err|
            TrafficError::InvalidConfig(format!("failed to parse config as yaml: {}", err)))?;
        match docs.first() {
            Some(doc) => EngineConfig::from_yaml(doc),
            None => Ok(EngineConfig::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<EngineConfig, TrafficError> {
        let file_contents = std::fs::read_to_string(path).map_err(|err|
            TrafficError::InvalidConfig(format!("failed to read {}: {}", path.display(), err)))?;
        log::info!("loading engine config from {}", path.display());
        EngineConfig::from_yaml_str(&file_contents)
    }

    pub fn validate(&self) -> Result<(), TrafficError> {
        if self.max_iterations == 0 {
            return Err(TrafficError::InvalidConfig(String::from("max_iterations must be > 0")));
        }
        let budget = Duration::try_from_secs_f64(self.time_budget_s);
        if !(self.time_budget_s > 0.) || budget.is_err() {
            return Err(TrafficError::InvalidConfig(format!(
                "time_budget_s must be > 0 and representable as a duration, got {}",
                self.time_budget_s)));
        }
        if self.candidate_path_bound == 0 || self.max_hops == 0 {
            return Err(TrafficError::InvalidConfig(
                String::from("candidate_path_bound and max_hops must be > 0")));
        }
        if self.num_reads == 0 {
            return Err(TrafficError::InvalidConfig(String::from("num_reads must be > 0")));
        }
        self.signal.validate()
    }

    /// The budget as a `Duration`.  Budgets too large to represent saturate.
    pub fn time_budget(&self) -> Duration {
        Duration::try_from_secs_f64(self.time_budget_s).unwrap_or(Duration::MAX)
    }

    pub fn with_seed(&self, random_seed: u64) -> EngineConfig {
        let mut cfg = self.clone();
        cfg.random_seed = random_seed;
        cfg
    }

    pub fn with_backend(&self, backend: Backend) -> EngineConfig {
        let mut cfg = self.clone();
        cfg.backend = backend;
        cfg
    }
}

fn read_u64(yaml_cfg: &Yaml, key: &str, default: u64) -> Result<u64, TrafficError> {
    let value = &yaml_cfg[key];
    if value.is_badvalue() {
        return Ok(default);
    }
    match value.as_i64() {
        Some(vv) if vv >= 0 => Ok(vv as u64),
        _ => Err(TrafficError::InvalidConfig(
            format!("'{}' must be a non-negative integer", key))),
    }
}

fn read_u32(yaml_cfg: &Yaml, key: &str, default: u32) -> Result<u32, TrafficError> {
    let value = read_u64(yaml_cfg, key, default as u64)?;
    u32::try_from(value).map_err(|_| TrafficError::InvalidConfig(
        format!("'{}' = {} does not fit in 32 bits", key, value)))
}

fn read_f64(yaml_cfg: &Yaml, key: &str, default: f64) -> Result<f64, TrafficError> {
    let value = &yaml_cfg[key];
    if value.is_badvalue() {
        return Ok(default);
    }
    // yaml writes whole numbers as integers
    match (value.as_f64(), value.as_i64()) {
        (Some(vv), _) => Ok(vv),
        (None, Some(vv)) => Ok(vv as f64),
        _ => Err(TrafficError::InvalidConfig(format!("'{}' must be a number", key))),
    }
}

fn read_bool(yaml_cfg: &Yaml, key: &str, default: bool) -> Result<bool, TrafficError> {
    let value = &yaml_cfg[key];
    if value.is_badvalue() {
        return Ok(default);
    }
    value.as_bool().ok_or_else(||
        TrafficError::InvalidConfig(format!("'{}' must be true or false", key)))
}

fn read_str<'a>(yaml_cfg: &'a Yaml, key: &str) -> Result<Option<&'a str>, TrafficError> {
    let value = &yaml_cfg[key];
    if value.is_badvalue() {
        return Ok(None);
    }
    match value.as_str() {
        Some(ss) => Ok(Some(ss)),
        None => Err(TrafficError::InvalidConfig(format!("'{}' must be a string", key))),
    }
}
