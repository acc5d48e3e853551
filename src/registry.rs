//! Maps a stable job type name to a factory producing a fresh job instance.
//!
//! A `Job` is implemented per job type rather than through an inheritance
//! hierarchy - a tagged capability, not a virtual base class. `Registry`
//! stores factories keyed by the name each job declares through
//! `Job::NAME`.

use std::collections::HashMap;
use std::fmt::Debug;

use serde_json::Value;

use crate::error::{Error, Result};

/// A background job type.
///
/// Implementors serialize their own state into the envelope's `data`
/// object (`to_data`) and restore it from there (`from_data`). The worker
/// injects the authoritative `tries`/`maxtries` fields into `data` before
/// calling `from_data`, so jobs never need to track their own attempt
/// count across a decode boundary.
pub trait Job: Debug + Send {
    /// Stable type name used as the registry key and the envelope's
    /// `className`. Must be identical across every process that produces
    /// or consumes jobs of this type.
    const NAME: &'static str;

    /// Default cap on attempts for this job type. Overridable per-instance
    /// by returning a different value from `max_tries`.
    const DEFAULT_MAX_TRIES: u32 = 3;

    /// Run one attempt. Returning `Err` is a failure; whether it is
    /// retried is decided by `retry_if_error` plus the attempt count, not
    /// by the error itself.
    fn handle(&mut self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Serialize this job's state into the envelope's `data` object. The
    /// `tries`/`maxtries` fields are added by the caller and must not be
    /// clobbered here.
    fn to_data(&self) -> Value;

    /// Restore state from a previously-serialized `data` object. Must
    /// tolerate missing fields by falling back to a default value.
    fn from_data(data: &Value) -> Self
    where
        Self: Sized;

    /// Whether a failed attempt should be retried, independent of the
    /// attempt count. The worker upgrades the outcome to a terminal
    /// failure if this returns `false`, or if `tries + 1 > maxtries`.
    fn retry_if_error(&self) -> bool {
        true
    }

    fn max_tries(&self) -> u32 {
        Self::DEFAULT_MAX_TRIES
    }
}

type JobFactory = Box<dyn Fn(&Value) -> Box<dyn JobObject> + Send + Sync>;

/// Object-safe wrapper around `Job` so the registry and worker can hold
/// trait objects without needing `Self: Sized` generics at the call site.
pub trait JobObject: Debug + Send {
    fn handle(&mut self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn to_data(&self) -> Value;
    fn retry_if_error(&self) -> bool;
    fn max_tries(&self) -> u32;
}

impl<T: Job> JobObject for T {
    fn handle(&mut self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Job::handle(self)
    }

    fn to_data(&self) -> Value {
        Job::to_data(self)
    }

    fn retry_if_error(&self) -> bool {
        Job::retry_if_error(self)
    }

    fn max_tries(&self) -> u32 {
        Job::max_tries(self)
    }
}

/// Registers job type factories by name and instantiates them from a
/// decoded payload. The same registered name must be used by every
/// process that may pop jobs of that type.
#[derive(Default)]
pub struct Registry {
    factories: HashMap<String, JobFactory>,
}

impl Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("registered", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            factories: HashMap::new(),
        }
    }

    /// Register a job type under `T::NAME`. Registering the same name
    /// twice is an error.
    pub fn register<T>(&mut self) -> Result<()>
    where
        T: Job + 'static,
    {
        if self.factories.contains_key(T::NAME) {
            return Err(Error::DuplicateRegistration(T::NAME.to_string()));
        }

        self.factories.insert(
            T::NAME.to_string(),
            Box::new(|data| Box::new(T::from_data(data))),
        );

        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate a job from its registered class name and a `data`
    /// object. Fails with `UnknownJob` if the name was never registered.
    pub fn instance(&self, name: &str, data: &Value) -> Result<Box<dyn JobObject>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownJob(name.to_string()))?;

        Ok(factory(data))
    }
}
