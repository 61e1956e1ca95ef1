//! Kernel specification models, as returned by the `/api/kernelspecs`
//! endpoint. See the [kernel specs] documentation for the file format this
//! mirrors.
//!
//! [kernel specs]: https://jupyter-client.readthedocs.io/en/latest/kernels.html#kernel-specs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Parsed contents of a `kernel.json` file.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct KernelSpec {
    /// Command-line arguments used to start the kernel.
    pub argv: Vec<String>,
    /// Display name shown to users.
    pub display_name: String,
    /// The language the kernel executes.
    pub language: String,
    /// How interrupts are communicated to the kernel.
    #[serde(default)]
    pub interrupt_mode: InterruptMode,
    /// Environment variables to set for the kernel process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Free-form metadata, commonly used by Jupyter frontends for icons and
    /// language server hints.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// How a kernel expects to receive interrupts.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptMode {
    /// Interrupts are sent as an OS signal (SIGINT).
    #[default]
    Signal,
    /// Interrupts are sent as a control-channel message.
    Message,
}

/// One named entry in a `/api/kernelspecs` response.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct KernelSpecFile {
    /// The kernel's registered name.
    pub name: String,
    /// The parsed `kernel.json` contents.
    pub spec: KernelSpec,
    /// Paths to static resources (e.g. a logo) the spec ships with.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

/// The full `/api/kernelspecs` response.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
pub struct SpecsBundle {
    /// The name of the default kernelspec.
    pub default: String,
    /// All available kernelspecs, keyed by name.
    pub kernelspecs: BTreeMap<String, KernelSpecFile>,
}

impl SpecsBundle {
    /// Check that `default` actually names an entry in `kernelspecs`.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.kernelspecs.contains_key(&self.default) {
            return Err(Error::MalformedModel(format!(
                "default kernelspec {:?} is not present in kernelspecs",
                self.default
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_default_not_in_map() {
        let bundle = SpecsBundle {
            default: "python3".into(),
            kernelspecs: BTreeMap::new(),
        };
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn accepts_consistent_bundle() {
        let mut kernelspecs = BTreeMap::new();
        kernelspecs.insert(
            "python3".to_string(),
            KernelSpecFile {
                name: "python3".into(),
                spec: KernelSpec {
                    argv: vec!["python3".into(), "-m".into(), "ipykernel".into()],
                    display_name: "Python 3".into(),
                    language: "python".into(),
                    interrupt_mode: InterruptMode::Signal,
                    env: BTreeMap::new(),
                    metadata: BTreeMap::new(),
                },
                resources: BTreeMap::new(),
            },
        );
        let bundle = SpecsBundle {
            default: "python3".into(),
            kernelspecs,
        };
        assert!(bundle.validate().is_ok());
    }
}
