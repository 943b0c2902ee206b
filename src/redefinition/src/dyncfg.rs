// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Dynamically updatable configuration of redefinition tasks.
//!
//! - Every knob is a typed, `const` [`Config`] handle, declared in
//!   [`crate::config`].
//! - The handles are registered into a [`ConfigSet`] once, and the set is
//!   handed to every task. Clones of a set share their values; sets built
//!   separately don't (e.g. one per unit test).
//! - Operators push [`ConfigUpdates`], usually decoded from JSON. Tasks read
//!   the knobs on every use, so an update applies from the next phase on.
//!
//! ```
//! # use std::time::Duration;
//! # use mz_redefinition::dyncfg::{Config, ConfigSet};
//! const POLL: Config<Duration> = Config::new("poll", Duration::from_secs(1), "poll interval");
//! let configs = ConfigSet::default().add(&POLL);
//! assert_eq!(POLL.get(&configs), Duration::from_secs(1));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// A handle to a dynamically updatable knob of type `T`.
#[derive(Clone, Copy, Debug)]
pub struct Config<T> {
    name: &'static str,
    desc: &'static str,
    default: T,
}

impl<T: ConfigType> Config<T> {
    pub const fn new(name: &'static str, default: T, desc: &'static str) -> Self {
        Config {
            name,
            desc,
            default,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn desc(&self) -> &'static str {
        self.desc
    }

    pub fn default(&self) -> T {
        self.default
    }

    /// The current value of this knob in `set`.
    ///
    /// Panics if the knob was never registered to `set`.
    pub fn get(&self, set: &ConfigSet) -> T {
        let entry = set
            .configs
            .get(self.name)
            .expect("config should be registered to set");
        let val = entry.val.read().expect("lock poisoned");
        T::from_value(&val).expect("registered with its own type")
    }
}

/// A type a [`Config`] can hold.
pub trait ConfigType: Copy {
    fn into_value(self) -> ConfigValue;

    fn from_value(value: &ConfigValue) -> Option<Self>;
}

impl ConfigType for usize {
    fn into_value(self) -> ConfigValue {
        ConfigValue::Usize(self)
    }

    fn from_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Usize(x) => Some(*x),
            _ => None,
        }
    }
}

impl ConfigType for Duration {
    fn into_value(self) -> ConfigValue {
        ConfigValue::Duration(self)
    }

    fn from_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Duration(x) => Some(*x),
            _ => None,
        }
    }
}

/// A plain, serializable config value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigValue {
    Usize(usize),
    Duration(Duration),
}

/// The registered state of one knob.
#[derive(Debug)]
pub struct ConfigEntry {
    name: &'static str,
    desc: &'static str,
    default: ConfigValue,
    val: RwLock<ConfigValue>,
}

impl ConfigEntry {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn desc(&self) -> &'static str {
        self.desc
    }

    /// Never updated.
    pub fn default(&self) -> &ConfigValue {
        &self.default
    }

    pub fn val(&self) -> ConfigValue {
        self.val.read().expect("lock poisoned").clone()
    }
}

/// A set of registered knobs.
#[derive(Clone, Default)]
pub struct ConfigSet {
    configs: BTreeMap<&'static str, Arc<ConfigEntry>>,
}

impl ConfigSet {
    /// Registers `config` at its default value.
    ///
    /// Panics if a knob of the same name is already registered.
    pub fn add<T: ConfigType>(mut self, config: &Config<T>) -> Self {
        let entry = ConfigEntry {
            name: config.name,
            desc: config.desc,
            default: config.default.into_value(),
            val: RwLock::new(config.default.into_value()),
        };
        if self.configs.insert(config.name, Arc::new(entry)).is_some() {
            panic!("{} registered twice", config.name);
        }
        self
    }

    pub fn entries(&self) -> impl Iterator<Item = &ConfigEntry> {
        self.configs.values().map(|entry| &**entry)
    }
}

impl fmt::Debug for ConfigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.configs.iter().map(|(name, entry)| (name, entry.val())))
            .finish()
    }
}

/// A batch of knob updates, keyed by knob name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdates {
    updates: BTreeMap<String, ConfigValue>,
}

impl ConfigUpdates {
    /// Adds the current value of `entry`.
    pub fn add(&mut self, entry: &ConfigEntry) {
        self.updates.insert(entry.name.to_owned(), entry.val());
    }

    pub fn add_value(&mut self, name: impl Into<String>, val: ConfigValue) {
        self.updates.insert(name.into(), val);
    }

    pub fn from_json(json: &str) -> Result<Self, anyhow::Error> {
        serde_json::from_str(json).context("decoding config updates")
    }

    /// Applies these updates to `set`. Updates of unknown knobs, or of the
    /// wrong type, are logged and skipped.
    pub fn apply(&self, set: &ConfigSet) {
        for (name, val) in &self.updates {
            let Some(entry) = set.configs.get(name.as_str()) else {
                error!(config = %name, ?val, "update of unknown config");
                continue;
            };
            let mut current = entry.val.write().expect("lock poisoned");
            if mem::discriminant(&*current) != mem::discriminant(val) {
                error!(config = %name, ?val, current = ?*current, "config update type mismatch");
                continue;
            }
            if *current != *val {
                info!(config = %name, from = ?*current, to = ?val, "config updated");
                *current = val.clone();
            }
        }
    }
}
