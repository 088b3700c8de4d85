#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use cloudengine_core::{retry::RetryPolicy, signal::FunctionSignal};
use cloudengine_core_k8s::{
    client::ClientError,
    manager::Controller,
    name::NamespacedName,
    scheme::{Scheme, TypeKey},
    singleton::Singleton,
};
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::{select, time::interval};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, CustomResource)]
#[kube(
    group = "test.cloudengine.io",
    version = "v1",
    kind = "Settings",
    root = "SettingsCrd",
    namespaced
)]
pub struct SettingsSpec {
    pub revision: u32,
}

impl Singleton for SettingsCrd {
    fn well_known_name() -> NamespacedName {
        NamespacedName::namespaced("default", "settings")
    }

    fn new_default() -> Self {
        // the ensurer renames it
        Self::new("unnamed", SettingsSpec { revision: 1 })
    }
}

pub fn settings(revision: u32) -> SettingsCrd {
    let mut settings = SettingsCrd::new("settings", SettingsSpec { revision });
    settings.meta_mut().namespace = Some("default".into());
    settings
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, CustomResource)]
#[kube(
    group = "test.cloudengine.io",
    version = "v1",
    kind = "Widget",
    root = "WidgetCrd",
    namespaced
)]
pub struct WidgetSpec {
    pub size: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, CustomResource)]
#[kube(
    group = "test.cloudengine.io",
    version = "v1",
    kind = "Gadget",
    root = "GadgetCrd"
)]
pub struct GadgetSpec {
    pub color: String,
}

/// Widget and Settings are registered; Gadget is left out on purpose.
pub fn scheme() -> Arc<Scheme> {
    let mut builder = Scheme::builder();
    builder
        .register::<SettingsCrd>()
        .unwrap()
        .register::<WidgetCrd>()
        .unwrap();
    Arc::new(builder.build())
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
        jitter: false,
    }
}

pub fn transient() -> ClientError {
    ClientError::Transient("connection reset by peer".into())
}

pub fn fatal() -> ClientError {
    ClientError::Fatal("forbidden".into())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Registered(String),
    Started(String),
    Reconciled(String),
    Stopped(String),
}

#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event)
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn reconciles(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, Event::Reconciled(_)))
            .count()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Behavior {
    /// Reconciles every few milliseconds until cancelled
    Reconcile,
    Fail,
    ExitEarly,
    /// Ignores cancellation
    Hang,
}

pub struct ScriptedController {
    pub behavior: Behavior,
    pub key: TypeKey,
    pub log: EventLog,
    pub name: String,
}

impl ScriptedController {
    pub fn new<K>(name: &str, behavior: Behavior, log: &EventLog) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            behavior,
            key: TypeKey::of::<K>(),
            log: log.clone(),
            name: name.into(),
        }
    }
}

#[async_trait]
impl Controller for ScriptedController {
    fn name(&self) -> &str {
        &self.name
    }

    fn watches(&self) -> &TypeKey {
        &self.key
    }

    async fn run(self: Box<Self>, signal: FunctionSignal) -> Result<()> {
        self.log.push(Event::Started(self.name.clone()));
        match self.behavior {
            Behavior::Reconcile => {
                let mut ticks = interval(Duration::from_millis(2));
                loop {
                    select! {
                        () = signal.wait_to_terminate() => break,
                        _ = ticks.tick() => self.log.push(Event::Reconciled(self.name.clone())),
                    }
                }
                self.log.push(Event::Stopped(self.name.clone()));
                Ok(())
            }
            Behavior::Fail => bail!("watch stream broke"),
            Behavior::ExitEarly => Ok(()),
            Behavior::Hang => {
                ::std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}
