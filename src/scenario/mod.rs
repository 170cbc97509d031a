//! Producer scenarios described in TOML.
//!
//! ```toml
//! name = "three-producers"
//! spawn = "thread"
//!
//! [[producer]]
//! name = "A"
//! items = ["A1", "A2", "A3"]
//!
//! [[producer]]
//! name = "B"
//! items = ["B1", "B2"]
//! ```
//!
//! Each producer runs on its own thread and enqueues its items in order. The
//! run passes when every item is delivered exactly once, each producer's
//! items arrive in that producer's order, and no two callbacks overlap.

pub mod record;
pub mod stress;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::SpawnMode;
use crate::error::{Error, Result};
use crate::gatherer::{Gatherer, Stats};
use record::{Recorder, Verdict};

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub spawn: SpawnMode,
    /// Seconds to wait for the drain after producers finish.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(rename = "producer", default)]
    pub producers: Vec<ProducerSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProducerSpec {
    pub name: String,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    /// Item labels in callback order.
    pub delivered: Vec<String>,
    pub verdict: Verdict,
    pub stats: Stats,
}

fn default_drain_timeout_secs() -> u64 {
    10
}

impl Scenario {
    /// Load and validate a scenario file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Scenario(format!("cannot read scenario {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let scenario: Scenario = toml::from_str(content)?;
        scenario.validate()?;
        Ok(scenario)
    }

    fn validate(&self) -> Result<()> {
        if self.producers.is_empty() {
            return Err(Error::Scenario(format!(
                "scenario {} has no producers",
                self.name
            )));
        }
        for (i, p) in self.producers.iter().enumerate() {
            if self.producers[..i].iter().any(|q| q.name == p.name) {
                return Err(Error::Scenario(format!(
                    "scenario {} has duplicate producer {}",
                    self.name, p.name
                )));
            }
        }
        Ok(())
    }

    pub fn total_items(&self) -> usize {
        self.producers.iter().map(|p| p.items.len()).sum()
    }

    /// Run the scenario against a fresh gatherer.
    ///
    /// # Errors
    ///
    /// `Error::Scenario` if the gatherer does not drain in time, or
    /// `Error::Config` if the gatherer cannot be built.
    pub fn run(&self) -> Result<ScenarioReport> {
        let recorder = Recorder::new();
        let labels = Arc::new(Mutex::new(Vec::with_capacity(self.total_items())));

        let gatherer = {
            let recorder = recorder.clone();
            let labels = Arc::clone(&labels);
            Gatherer::builder()
                .name(self.name.clone())
                .spawn_mode(self.spawn)
                .callback(move |(producer, seq, label): (usize, usize, String)| {
                    recorder.record(producer, seq, || {
                        labels
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .push(label);
                    });
                })
                .build()?
        };

        std::thread::scope(|s| {
            for (producer, spec) in self.producers.iter().enumerate() {
                let g = gatherer.clone();
                s.spawn(move || {
                    for (seq, label) in spec.items.iter().enumerate() {
                        g.enqueue((producer, seq, label.clone()));
                    }
                });
            }
        });

        let timeout = Duration::from_secs(self.drain_timeout_secs);
        if !gatherer.wait_idle(timeout) {
            return Err(Error::Scenario(format!(
                "scenario {} did not drain within {timeout:?}",
                self.name
            )));
        }

        let expected: Vec<usize> = self.producers.iter().map(|p| p.items.len()).collect();
        let delivered = labels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        Ok(ScenarioReport {
            name: self.name.clone(),
            delivered,
            verdict: recorder.verify(&expected),
            stats: gatherer.stats(),
        })
    }
}
