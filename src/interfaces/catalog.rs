//! Interface catalog: the table of known capabilities.

use super::{InterfaceDescriptor, MethodSignature, ParamType, IMODULE, LIST_INTERFACES};
use crate::types::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// A method together with the interface that declares it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMethod {
    pub interface: String,
    pub signature: MethodSignature,
}

/// Known interface descriptors, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct InterfaceCatalog {
    interfaces: BTreeMap<String, InterfaceDescriptor>,
}

impl InterfaceCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the standard observatory interfaces.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for descriptor in builtin_descriptors() {
            catalog
                .interfaces
                .insert(descriptor.name.clone(), descriptor);
        }
        catalog
    }

    /// Add a descriptor. Parents must already be registered, which also
    /// rules out cycles.
    pub fn register(&mut self, descriptor: InterfaceDescriptor) -> Result<()> {
        if descriptor.name.is_empty() {
            return Err(Error::validation("interface name cannot be empty"));
        }
        if self.interfaces.contains_key(&descriptor.name) {
            return Err(Error::validation(format!(
                "interface already registered: {}",
                descriptor.name
            )));
        }
        for parent in &descriptor.extends {
            if !self.interfaces.contains_key(parent) {
                return Err(Error::validation(format!(
                    "{} extends unknown interface {}",
                    descriptor.name, parent
                )));
            }
        }
        let mut seen = BTreeSet::new();
        for method in &descriptor.methods {
            if method.name == LIST_INTERFACES {
                return Err(Error::validation(format!(
                    "{}: method name {} is reserved",
                    descriptor.name, LIST_INTERFACES
                )));
            }
            if !seen.insert(method.name.as_str()) {
                return Err(Error::validation(format!(
                    "{}: duplicate method {}",
                    descriptor.name, method.name
                )));
            }
        }
        self.interfaces.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Builder-style `register`.
    pub fn with(mut self, descriptor: InterfaceDescriptor) -> Result<Self> {
        self.register(descriptor)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&InterfaceDescriptor> {
        self.interfaces.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.interfaces.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.interfaces.keys().map(String::as_str)
    }

    /// The interface plus everything it extends, transitively.
    pub fn closure(&self, name: &str) -> Result<BTreeSet<String>> {
        self.closure_of([name])
    }

    /// Union of the closures of several interfaces.
    pub fn closure_of<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<&str> = names.into_iter().collect();
        while let Some(name) = stack.pop() {
            if out.contains(name) {
                continue;
            }
            let descriptor = self
                .interfaces
                .get(name)
                .ok_or_else(|| Error::validation(format!("unknown interface: {}", name)))?;
            out.insert(name.to_string());
            stack.extend(descriptor.extends.iter().map(String::as_str));
        }
        Ok(out)
    }

    /// Every method reachable from an interface, keyed by method name.
    pub fn methods(&self, name: &str) -> Result<BTreeMap<String, ResolvedMethod>> {
        self.methods_of([name])
    }

    /// Every method reachable from several interfaces.
    ///
    /// Fails if two interfaces declare the same method name with different
    /// signatures.
    pub fn methods_of<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<BTreeMap<String, ResolvedMethod>> {
        let mut out: BTreeMap<String, ResolvedMethod> = BTreeMap::new();
        for interface in self.closure_of(names)? {
            let Some(descriptor) = self.interfaces.get(&interface) else {
                continue;
            };
            for signature in &descriptor.methods {
                if let Some(existing) = out.get(&signature.name) {
                    if existing.signature != *signature {
                        return Err(Error::validation(format!(
                            "method {} declared differently by {} and {}",
                            signature.name, existing.interface, interface
                        )));
                    }
                    continue;
                }
                out.insert(
                    signature.name.clone(),
                    ResolvedMethod {
                        interface: interface.clone(),
                        signature: signature.clone(),
                    },
                );
            }
        }
        Ok(out)
    }
}

// =============================================================================
// Built-in interfaces
// =============================================================================

fn builtin_descriptors() -> Vec<InterfaceDescriptor> {
    use ParamType::{Bool, Dict, Float, Int, List, Str};

    let minutes = |m: u64| Duration::from_secs(m * 60);

    vec![
        InterfaceDescriptor::new(IMODULE)
            .method(MethodSignature::new("get_state").returns(Str))
            .method(MethodSignature::new("get_error_string").returns(Str))
            .method(MethodSignature::new("reset_error").returns(Bool))
            .method(MethodSignature::new("get_label").returns(Str))
            .method(MethodSignature::new("get_version").returns(Str)),
        InterfaceDescriptor::new("IAbortable").method(MethodSignature::new("abort")),
        InterfaceDescriptor::new("ICamera")
            .extends("IAbortable")
            .method(
                MethodSignature::new("expose")
                    .param("broadcast", ParamType::optional(Bool))
                    .returns(Str)
                    .timeout(minutes(5)),
            )
            .method(MethodSignature::new("get_exposure_status").returns(Str))
            .method(MethodSignature::new("get_exposure_progress").returns(Float)),
        InterfaceDescriptor::new("IExposureTime")
            .method(MethodSignature::new("set_exposure_time").param("exposure_time", Float))
            .method(MethodSignature::new("get_exposure_time").returns(Float))
            .method(MethodSignature::new("get_exposure_time_left").returns(Float)),
        InterfaceDescriptor::new("IBinning")
            .method(
                MethodSignature::new("set_binning")
                    .param("x", Int)
                    .param("y", Int),
            )
            .method(MethodSignature::new("get_binning").returns(List))
            .method(MethodSignature::new("list_binnings").returns(List)),
        InterfaceDescriptor::new("ITelescope")
            .extends("IAbortable")
            .method(MethodSignature::new("init").timeout(minutes(5)))
            .method(MethodSignature::new("park").timeout(minutes(5)))
            .method(
                MethodSignature::new("move_radec")
                    .param("ra", Float)
                    .param("dec", Float)
                    .timeout(minutes(20)),
            )
            .method(
                MethodSignature::new("move_altaz")
                    .param("alt", Float)
                    .param("az", Float)
                    .timeout(minutes(20)),
            )
            .method(MethodSignature::new("get_radec").returns(List))
            .method(MethodSignature::new("get_altaz").returns(List))
            .method(MethodSignature::new("get_motion_status").returns(Str)),
        InterfaceDescriptor::new("IFocuser")
            .extends("IAbortable")
            .method(
                MethodSignature::new("set_focus")
                    .param("focus", Float)
                    .timeout(minutes(5)),
            )
            .method(MethodSignature::new("get_focus").returns(Float)),
        InterfaceDescriptor::new("IAutoFocus")
            .extends("IAbortable")
            .method(
                MethodSignature::new("auto_focus")
                    .param("count", Int)
                    .param("step", Float)
                    .param("exposure_time", Float)
                    .returns(List)
                    .timeout(minutes(30)),
            )
            .method(MethodSignature::new("auto_focus_status").returns(Dict)),
        InterfaceDescriptor::new("IRoof")
            .extends("IAbortable")
            .method(MethodSignature::new("open_roof").timeout(minutes(20)))
            .method(MethodSignature::new("close_roof").timeout(minutes(20)))
            .method(MethodSignature::new("get_motion_status").returns(Str)),
        InterfaceDescriptor::new("IWeather")
            .method(MethodSignature::new("is_weather_good").returns(Bool))
            .method(MethodSignature::new("get_current_weather").returns(Dict))
            .method(
                MethodSignature::new("get_sensor_value")
                    .param("station", Str)
                    .param("sensor", Str)
                    .returns(List),
            ),
    ]
}
