//! The backend descriptor loader (C1): scans an install directory and turns
//! each qualifying subdirectory into a [`Backend`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use parking_lot::RwLock as SyncRwLock;
use serde::Deserialize;

use crate::error::LoadErrors;
use crate::store::{Backend, BackendRuntime};

/// Descriptor file name convention, per spec section 6.
pub const DESCRIPTOR_FILE_NAME: &str = "nixcraft.json";

/// The fixed JVM invocation spec section 4.1 mandates.
const BASE_JVM_ARGS: &[&str] = &["-Xms4G", "-Xmx8G"];

#[derive(Deserialize)]
struct BackendDescriptorFile {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    version: String,
    jar: String,
    /// Additive JVM args appended after the fixed invocation — a restored
    /// feature from the original `javaExec.args` field (SPEC_FULL.md 4.1).
    #[serde(default)]
    args: Vec<String>,
}

/// Monotonically increasing private-port offset. Never reset, even across
/// reload — spec section 9's Open Question (a): this guarantees uniqueness,
/// not stability, and the design explicitly keeps that behavior so a backend
/// whose old private port is still in TIME_WAIT is never reassigned.
pub struct PortAllocator {
    next_offset: AtomicU16,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            next_offset: AtomicU16::new(0),
        }
    }

    pub fn allocate(&self, public_port: u16) -> u16 {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst) + 1;
        public_port.wrapping_add(offset)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Scans `install_dir`'s immediate subdirectories for a `nixcraft.json`
/// descriptor and builds one [`Backend`] per valid entry. Malformed
/// descriptors are collected as non-fatal errors; other backends still load.
pub fn load_backends(
    install_dir: &Path,
    public_port: u16,
    ports: &PortAllocator,
) -> Result<HashMap<String, Arc<Backend>>, LoadErrors> {
    let mut backends = HashMap::new();
    let mut errors = Vec::new();

    let entries = match std::fs::read_dir(install_dir) {
        Ok(entries) => entries,
        Err(e) => {
            errors.push(anyhow::anyhow!(e).context(format!(
                "reading install directory {}",
                install_dir.display()
            )));
            return Err(LoadErrors(errors));
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                errors.push(anyhow::anyhow!(e).context("reading install directory entry"));
                continue;
            }
        };

        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().into_owned();

        let descriptor_path = path.join(DESCRIPTOR_FILE_NAME);
        if !descriptor_path.is_file() {
            continue;
        }

        match load_one(&path, &dir_name, public_port, ports) {
            Ok(backend) => {
                backends.insert(dir_name, Arc::new(backend));
            }
            Err(e) => errors.push(e.context(format!("loading backend {dir_name}"))),
        }
    }

    if errors.is_empty() {
        Ok(backends)
    } else if backends.is_empty() {
        Err(LoadErrors(errors))
    } else {
        // Partial success is the norm (spec section 7): callers that want the
        // errors surfaced can inspect them via `load_backends_lenient`.
        Ok(backends)
    }
}

/// Like [`load_backends`] but always returns both the loaded backends and
/// the aggregated errors, letting the caller decide how to report them.
pub fn load_backends_lenient(
    install_dir: &Path,
    public_port: u16,
    ports: &PortAllocator,
) -> (HashMap<String, Arc<Backend>>, LoadErrors) {
    match load_backends(install_dir, public_port, ports) {
        Ok(backends) => (backends, LoadErrors::default()),
        Err(errors) => (HashMap::new(), errors),
    }
}

fn load_one(
    dir: &Path,
    dir_name: &str,
    public_port: u16,
    ports: &PortAllocator,
) -> anyhow::Result<Backend> {
    let descriptor_path = dir.join(DESCRIPTOR_FILE_NAME);
    let raw = std::fs::read_to_string(&descriptor_path)?;
    let descriptor: BackendDescriptorFile = serde_json::from_str(&raw)?;

    if descriptor.name != dir_name {
        tracing::warn!(
            descriptor_name = %descriptor.name,
            dir_name,
            "backend descriptor name does not match its directory; using directory name"
        );
    }

    let private_port = ports.allocate(public_port);

    let mut args: Vec<String> = BASE_JVM_ARGS.iter().map(|s| s.to_string()).collect();
    args.push("-jar".to_owned());
    args.push(descriptor.jar);
    args.push("--port".to_owned());
    args.push(private_port.to_string());
    args.push("nogui".to_owned());
    args.extend(descriptor.args);

    Ok(Backend {
        name: dir_name.to_owned(),
        kind: descriptor.kind,
        version: descriptor.version,
        working_dir: dir.to_owned(),
        executable: "java".to_owned(),
        args,
        private_port,
        runtime: SyncRwLock::new(BackendRuntime::default()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_descriptor(dir: &Path, name: &str, jar: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(
            dir.join(DESCRIPTOR_FILE_NAME),
            format!(r#"{{"name":"{name}","type":"vanilla","version":"1.20.1","jar":"{jar}"}}"#),
        )
        .unwrap();
    }

    #[test]
    fn loads_one_backend_per_descriptor_subdirectory() {
        let tmp = tempfile::tempdir().unwrap();
        write_descriptor(&tmp.path().join("alpha"), "alpha", "server.jar");
        write_descriptor(&tmp.path().join("beta"), "beta", "server.jar");
        fs::create_dir_all(tmp.path().join("no_descriptor")).unwrap();

        let ports = PortAllocator::new();
        let backends = load_backends(tmp.path(), 25565, &ports).unwrap();

        assert_eq!(backends.len(), 2);
        assert!(backends.contains_key("alpha"));
        assert!(backends.contains_key("beta"));
        assert!(!backends.contains_key("no_descriptor"));
    }

    #[test]
    fn private_ports_are_unique_and_offset_from_public() {
        let tmp = tempfile::tempdir().unwrap();
        write_descriptor(&tmp.path().join("alpha"), "alpha", "server.jar");
        write_descriptor(&tmp.path().join("beta"), "beta", "server.jar");

        let ports = PortAllocator::new();
        let backends = load_backends(tmp.path(), 25565, &ports).unwrap();

        let a = backends["alpha"].private_port;
        let b = backends["beta"].private_port;
        assert_ne!(a, b);
        assert!(a > 25565 && b > 25565);
    }

    #[test]
    fn port_allocator_never_reuses_offsets_across_calls() {
        let ports = PortAllocator::new();
        let first = ports.allocate(25565);
        let second = ports.allocate(25565);
        assert_ne!(first, second);
    }

    #[test]
    fn malformed_descriptor_is_collected_but_does_not_block_others() {
        let tmp = tempfile::tempdir().unwrap();
        write_descriptor(&tmp.path().join("good"), "good", "server.jar");
        fs::create_dir_all(tmp.path().join("bad")).unwrap();
        fs::write(tmp.path().join("bad").join(DESCRIPTOR_FILE_NAME), "not json").unwrap();

        let ports = PortAllocator::new();
        let (backends, errors) = load_backends_lenient(tmp.path(), 25565, &ports);

        assert!(backends.contains_key("good"));
        assert!(!backends.contains_key("bad"));
        assert_eq!(errors.0.len(), 1);
    }
}
