// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! In-process [`ClRuntime`].
//!
//! Kernel names map to host programs. "Compiling" parses the build options
//! into [`Defines`] and caches the result under the program key; enqueue
//! runs the program eagerly over the given window. Programs see only the
//! defines, so everything a kernel needs must travel through its options.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, trace};

use super::options::BuildOptions;
use super::runtime::{program_key, ClRuntime, DeviceInfo, KernelHandle, Lws};
use crate::error::KernelError;
use crate::telemetry;
use crate::types::TensorPack;
use crate::window::Window;

const DEFINE_PATTERN: &str = r"^-D([A-Za-z_][A-Za-z0-9_]*)(?:=(\S+))?$";

fn define_pattern() -> Result<&'static Regex, KernelError> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(DEFINE_PATTERN))
        .as_ref()
        .map_err(|e| KernelError::Compile {
            name: "<options>".to_string(),
            reason: format!("invalid define pattern: {e}"),
        })
}

/// Preprocessor defines of one compiled program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Defines {
    values: HashMap<String, Option<String>>,
}

impl Defines {
    /// Parse `-DNAME` / `-DNAME=VALUE` options; anything else is ignored.
    pub fn parse(options: &BuildOptions) -> Result<Self, KernelError> {
        let pattern = define_pattern()?;
        let mut values = HashMap::new();
        for option in options.options() {
            if let Some(caps) = pattern.captures(option) {
                let value = caps.get(2).map(|m| m.as_str().to_string());
                values.insert(caps[1].to_string(), value);
            }
        }
        Ok(Self { values })
    }

    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    fn raw(&self, name: &str) -> Result<&str, KernelError> {
        match self.values.get(name) {
            Some(Some(value)) => Ok(value),
            Some(None) => Err(KernelError::Enqueue(format!("macro {name} has no value"))),
            None => Err(KernelError::Enqueue(format!("use of undeclared identifier '{name}'"))),
        }
    }

    pub fn get<T: FromStr>(&self, name: &str) -> Result<T, KernelError> {
        let raw = self.raw(name)?;
        raw.parse()
            .map_err(|_| KernelError::Enqueue(format!("cannot parse {name}={raw}")))
    }

    /// Value of `name`, or `default` when it is not defined.
    pub fn get_or<T: FromStr>(&self, name: &str, default: T) -> Result<T, KernelError> {
        if self.has(name) {
            self.get(name)
        } else {
            Ok(default)
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Host rendition of one device kernel.
pub trait HostProgram: Send + Sync {
    /// Defines without which the program does not compile.
    fn required_defines(&self) -> &'static [&'static str] {
        &[]
    }

    fn run(&self, defines: &Defines, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError>;
}

struct CompiledProgram {
    defines: Defines,
    program: Arc<dyn HostProgram>,
}

/// Runtime that executes kernels on the calling thread.
pub struct HostClRuntime {
    device: DeviceInfo,
    programs: RwLock<HashMap<String, Arc<dyn HostProgram>>>,
    cache: DashMap<String, Arc<CompiledProgram>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HostClRuntime {
    /// Runtime with an empty program registry.
    pub fn new(device: DeviceInfo) -> Self {
        Self {
            device,
            programs: RwLock::new(HashMap::new()),
            cache: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Host device with every kernel of this crate registered.
    pub fn with_builtin_programs() -> Self {
        Self::with_device(DeviceInfo::host())
    }

    pub fn with_device(device: DeviceInfo) -> Self {
        let runtime = Self::new(device);
        super::kernels::register_host_programs(&runtime);
        runtime
    }

    pub fn register(&self, name: &str, program: Arc<dyn HostProgram>) {
        self.programs.write().insert(name.to_string(), program);
    }

    pub fn has_program(&self, name: &str) -> bool {
        self.programs.read().contains_key(name)
    }

    pub fn cache_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn cached_programs(&self) -> usize {
        self.cache.len()
    }
}

impl Default for HostClRuntime {
    fn default() -> Self {
        Self::with_builtin_programs()
    }
}

impl ClRuntime for HostClRuntime {
    fn compile(&self, name: &str, options: &BuildOptions) -> Result<KernelHandle, KernelError> {
        let key = program_key(name, options);
        if self.cache.contains_key(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            telemetry::record_cl_compile(true);
            return Ok(KernelHandle::new(name, key));
        }

        let program = self
            .programs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::Compile {
                name: name.to_string(),
                reason: "no such kernel".to_string(),
            })?;
        let defines = Defines::parse(options)?;
        if let Some(missing) = program.required_defines().iter().find(|d| !defines.has(d)) {
            return Err(KernelError::Compile {
                name: name.to_string(),
                reason: format!("use of undeclared identifier '{missing}'"),
            });
        }

        debug!(kernel = %name, key = %&key[..12], options = %options, "compiled device program");
        self.cache
            .insert(key.clone(), Arc::new(CompiledProgram { defines, program }));
        self.misses.fetch_add(1, Ordering::Relaxed);
        telemetry::record_cl_compile(false);
        Ok(KernelHandle::new(name, key))
    }

    fn enqueue(
        &self,
        kernel: &KernelHandle,
        tensors: &TensorPack<'_>,
        window: &Window,
        lws: Option<Lws>,
    ) -> Result<(), KernelError> {
        let compiled = self
            .cache
            .get(kernel.key())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| KernelError::Enqueue(format!("{kernel} was not compiled by this runtime")))?;
        trace!(kernel = %kernel, window = %window, lws = ?lws, "enqueue");
        compiled.program.run(&compiled.defines, tensors, window)
    }

    fn device_info(&self) -> &DeviceInfo {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        runs: AtomicUsize,
    }

    impl HostProgram for Counting {
        fn required_defines(&self) -> &'static [&'static str] {
            &["VEC_SIZE"]
        }

        fn run(&self, defines: &Defines, _: &TensorPack<'_>, _: &Window) -> Result<(), KernelError> {
            let vec: usize = defines.get("VEC_SIZE")?;
            self.runs.fetch_add(vec, Ordering::Relaxed);
            Ok(())
        }
    }

    fn options(vec: usize) -> BuildOptions {
        let mut opts = BuildOptions::new();
        opts.define("VEC_SIZE", vec).flag("ADD_BIAS");
        opts
    }

    #[test]
    fn test_defines_parse() {
        let mut opts = options(4);
        opts.define("RESULT_SHIFT", -2).add_option("-cl-fast-relaxed-math");
        let defines = Defines::parse(&opts).unwrap();
        assert_eq!(defines.len(), 3);
        assert!(defines.has("ADD_BIAS"));
        assert_eq!(defines.get::<i32>("RESULT_SHIFT").unwrap(), -2);
        assert_eq!(defines.get_or::<i32>("MIN_BOUND", 7).unwrap(), 7);
        assert!(defines.get::<i32>("ADD_BIAS").is_err());
        assert!(defines.get::<i32>("MISSING").is_err());
    }

    #[test]
    fn test_compile_cache_hits() {
        let runtime = HostClRuntime::new(DeviceInfo::host());
        let program = Arc::new(Counting { runs: AtomicUsize::new(0) });
        runtime.register("counting", program.clone());

        let first = runtime.compile("counting", &options(4)).unwrap();
        let second = runtime.compile("counting", &options(4)).unwrap();
        runtime.compile("counting", &options(8)).unwrap();
        assert_eq!(first, second);
        assert_eq!(runtime.cache_hits(), 1);
        assert_eq!(runtime.cache_misses(), 2);
        assert_eq!(runtime.cached_programs(), 2);

        runtime
            .enqueue(&first, &TensorPack::new(), &Window::new(), None)
            .unwrap();
        assert_eq!(program.runs.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_compile_errors() {
        let runtime = HostClRuntime::new(DeviceInfo::host());
        runtime.register("counting", Arc::new(Counting { runs: AtomicUsize::new(0) }));

        let err = runtime.compile("unknown", &options(4)).unwrap_err();
        assert!(matches!(err, KernelError::Compile { .. }));
        let err = runtime.compile("counting", &BuildOptions::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Kernel compilation failed for counting: use of undeclared identifier 'VEC_SIZE'"
        );

        let stale = KernelHandle::new("counting", "feed");
        assert!(matches!(
            runtime.enqueue(&stale, &TensorPack::new(), &Window::new(), None),
            Err(KernelError::Enqueue(_))
        ));
    }
}
