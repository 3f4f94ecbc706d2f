//! Configuration documents for clock trees, ports, and events.
//!
//! Clock trees can be described in JSON and built against a
//! [`ClockManager`]. Incoming documents are validated against the
//! embedded schema before deserialization so malformed files fail with
//! schema paths instead of builder errors.

use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use anyhow::{anyhow, bail, Context, Result};
use jsonschema::JSONSchema;
use log::warn;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::clock::{Clock, ClockManager};
use crate::events::{Event, EventSet};
use crate::ports::{
    DataInPort, DataOutPort, PortSet, SignalInPort, SignalOutPort, SyncInPort,
};
use crate::sched::SchedulingPhase;
use crate::Cycle;

// Compiled once; a schema that fails to compile disables validation
// rather than wedging every load.
static CLOCK_TREE_SCHEMA: Lazy<Option<JSONSchema>> = Lazy::new(|| {
    let schema_str = include_str!("../../schemas/clock_tree.v1.json");
    let compiled = serde_json::from_str::<JsonValue>(schema_str)
        .ok()
        .and_then(|schema| JSONSchema::compile(&schema).ok());
    if compiled.is_none() {
        warn!("failed to compile embedded clock tree schema; validation disabled");
    }
    compiled
});

fn default_ratio() -> u32 {
    1
}

/// One clock in a [`ClockTreeConfig`]. Ratio mode and frequency mode are
/// mutually exclusive per clock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClockSpec {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default = "default_ratio")]
    pub parent_ratio: u32,
    #[serde(default = "default_ratio")]
    pub child_ratio: u32,
    #[serde(default)]
    pub frequency_mhz: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClockTreeConfig {
    pub clocks: Vec<ClockSpec>,
}

impl ClockTreeConfig {
    pub fn load_from_json(path: &Path) -> Result<ClockTreeConfig> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading clock config {}", path.display()))?;
        let value: JsonValue = serde_json::from_str(&data)
            .with_context(|| format!("parsing clock config {}", path.display()))?;

        if let Some(schema) = CLOCK_TREE_SCHEMA.as_ref() {
            if let Err(errors) = schema.validate(&value) {
                let messages: Vec<String> = errors
                    .map(|e| format!("{} (at {})", e, e.instance_path))
                    .collect();
                bail!(
                    "clock config {} failed schema validation: {}",
                    path.display(),
                    messages.join("; ")
                );
            }
        }

        let config: ClockTreeConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks beyond the schema: one root, known parents,
    /// no per-clock mode mixing.
    pub fn validate(&self) -> Result<()> {
        let mut roots = 0usize;
        let mut seen: Vec<&str> = Vec::new();
        for spec in &self.clocks {
            if spec.parent.is_none() {
                roots += 1;
                if spec.frequency_mhz.is_some() {
                    bail!("root clock '{}' cannot take a frequency", spec.name);
                }
            }
            if spec.frequency_mhz.is_some()
                && (spec.parent_ratio != 1 || spec.child_ratio != 1)
            {
                bail!(
                    "clock '{}' specifies both a frequency and a ratio; pick one",
                    spec.name
                );
            }
            if let Some(parent) = &spec.parent {
                if !seen.contains(&parent.as_str()) {
                    bail!(
                        "clock '{}' references parent '{}' which is not defined before it",
                        spec.name,
                        parent
                    );
                }
            }
            seen.push(&spec.name);
        }
        if roots != 1 {
            bail!("clock config must define exactly one root clock, found {}", roots);
        }
        Ok(())
    }

    /// Create the clocks on `manager` (without normalizing) and return
    /// them by name.
    pub fn build(&self, manager: &ClockManager) -> Result<HashMap<String, Rc<Clock>>> {
        let mut clocks: HashMap<String, Rc<Clock>> = HashMap::new();
        for spec in &self.clocks {
            let clock = match &spec.parent {
                None => manager.make_root(&spec.name)?,
                Some(parent_name) => {
                    let parent = clocks
                        .get(parent_name)
                        .ok_or_else(|| anyhow!("unknown parent clock '{}'", parent_name))?;
                    match spec.frequency_mhz {
                        Some(mhz) => {
                            manager.make_clock_with_frequency(&spec.name, parent, mhz)?
                        }
                        None => manager.make_clock(
                            &spec.name,
                            parent,
                            spec.parent_ratio,
                            spec.child_ratio,
                        )?,
                    }
                }
            };
            clocks.insert(spec.name.clone(), clock);
        }
        Ok(clocks)
    }
}

/// Construction options for in-ports.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InPortOptions {
    pub name: String,
    #[serde(default)]
    pub port_delay_cycles: Cycle,
    /// Defaults to `PortUpdate` when delayed, `Tick` otherwise.
    #[serde(default)]
    pub delivery_phase: Option<SchedulingPhase>,
}

impl InPortOptions {
    pub fn build_data_in<T: Clone + 'static>(
        &self,
        port_set: &Rc<PortSet>,
    ) -> Result<Rc<DataInPort<T>>> {
        match self.delivery_phase {
            Some(phase) => {
                DataInPort::with_phase(port_set, &self.name, phase, self.port_delay_cycles)
            }
            None => DataInPort::new(port_set, &self.name, self.port_delay_cycles),
        }
    }

    pub fn build_signal_in(&self, port_set: &Rc<PortSet>) -> Result<Rc<SignalInPort>> {
        match self.delivery_phase {
            Some(phase) => {
                SignalInPort::with_phase(port_set, &self.name, phase, self.port_delay_cycles)
            }
            None => SignalInPort::new(port_set, &self.name, self.port_delay_cycles),
        }
    }
}

/// Construction options for out-ports.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutPortOptions {
    pub name: String,
    #[serde(default = "default_presume_zero_delay")]
    pub presume_zero_delay: bool,
}

fn default_presume_zero_delay() -> bool {
    true
}

impl OutPortOptions {
    pub fn build_data_out<T: Clone + 'static>(
        &self,
        port_set: &Rc<PortSet>,
    ) -> Result<Rc<DataOutPort<T>>> {
        DataOutPort::with_options(port_set, &self.name, self.presume_zero_delay)
    }

    pub fn build_signal_out(&self, port_set: &Rc<PortSet>) -> Result<Rc<SignalOutPort>> {
        SignalOutPort::with_options(port_set, &self.name, self.presume_zero_delay)
    }
}

/// Options specific to sync in-ports, applied after construction and
/// before binding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncPortOptions {
    #[serde(default = "default_initial_ready")]
    pub initial_ready_state: bool,
    #[serde(default)]
    pub receive_delay_cycles: Cycle,
}

fn default_initial_ready() -> bool {
    true
}

impl SyncPortOptions {
    pub fn apply<T: Clone + 'static>(&self, port: &SyncInPort<T>) -> Result<()> {
        use crate::ports::Port;
        if self.receive_delay_cycles != 0 {
            port.set_port_delay(self.receive_delay_cycles)?;
        }
        port.set_initial_ready_state(self.initial_ready_state)
    }
}

/// Construction options for plain events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventOptions {
    pub name: String,
    pub phase: SchedulingPhase,
    #[serde(default)]
    pub default_delay_cycles: Cycle,
    #[serde(default = "default_continuing")]
    pub continuing: bool,
}

fn default_continuing() -> bool {
    true
}

impl EventOptions {
    pub fn build(
        &self,
        event_set: &EventSet,
        handler: impl FnMut() -> Result<()> + 'static,
    ) -> Result<Event> {
        let event = Event::new(event_set, &self.name, self.phase, handler)?;
        event.set_default_delay(self.default_delay_cycles);
        event.set_continuing(self.continuing);
        Ok(event)
    }
}
