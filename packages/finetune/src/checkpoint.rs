use std::{
    collections::BTreeSet,
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::autograd::Tape;

const MAGIC: &[u8; 4] = b"SCLR";
const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid checkpoint: {0}")]
    InvalidFormat(String),
    #[error("state mismatch in {module}: {detail}")]
    StateMismatch { module: String, detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub rows: usize,
    pub cols: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub spec: TensorSpec,
    pub data: Vec<f64>,
}

/// Parameter name → tensor mapping for one module, in registration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDict {
    pub tensors: Vec<NamedTensor>,
}

impl StateDict {
    pub fn capture(named_params: &[(String, usize)], tape: &Tape) -> Self {
        let tensors = named_params
            .iter()
            .map(|(name, idx)| {
                let param = &tape.params()[*idx];
                NamedTensor {
                    spec: TensorSpec {
                        name: name.clone(),
                        rows: param.rows,
                        cols: param.cols,
                    },
                    data: param.data.clone(),
                }
            })
            .collect();
        Self { tensors }
    }

    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.iter().find(|t| t.spec.name == name)
    }

    /// Strict load: names and shapes must match exactly. Nothing is written
    /// to the tape unless every tensor matches.
    pub fn apply(
        &self,
        module: &str,
        named_params: &[(String, usize)],
        tape: &mut Tape,
    ) -> Result<(), CheckpointError> {
        let mismatch = |detail: String| CheckpointError::StateMismatch {
            module: module.to_string(),
            detail,
        };

        let expected = named_params
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<BTreeSet<_>>();
        let stored = self
            .tensors
            .iter()
            .map(|t| t.spec.name.as_str())
            .collect::<BTreeSet<_>>();
        if let Some(missing) = expected.difference(&stored).next() {
            return Err(mismatch(format!("missing key {missing}")));
        }
        if let Some(unexpected) = stored.difference(&expected).next() {
            return Err(mismatch(format!("unexpected key {unexpected}")));
        }

        for (name, idx) in named_params {
            let param = &tape.params()[*idx];
            let tensor = self
                .get(name)
                .ok_or_else(|| mismatch(format!("missing key {name}")))?;
            if tensor.spec.rows != param.rows || tensor.spec.cols != param.cols {
                return Err(mismatch(format!(
                    "size mismatch for {name}: checkpoint {}x{}, module {}x{}",
                    tensor.spec.rows, tensor.spec.cols, param.rows, param.cols
                )));
            }
        }

        for (name, idx) in named_params {
            if let Some(tensor) = self.get(name) {
                tape.params_mut()[*idx].data.copy_from_slice(&tensor.data);
            }
        }
        Ok(())
    }

    fn specs(&self) -> Vec<TensorSpec> {
        self.tensors.iter().map(|t| t.spec.clone()).collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    encoder: Vec<TensorSpec>,
    head: Vec<TensorSpec>,
}

/// The persisted two-entry mapping: encoder state and head state, kept apart
/// so either module can be reused without the other.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub encoder: StateDict,
    pub head: StateDict,
}

impl Checkpoint {
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let mut file = BufWriter::new(File::create(path)?);
        let manifest = serde_json::to_vec(&Manifest {
            encoder: self.encoder.specs(),
            head: self.head.specs(),
        })?;

        file.write_all(MAGIC)?;
        file.write_all(&VERSION.to_le_bytes())?;
        file.write_all(&(manifest.len() as u32).to_le_bytes())?;
        file.write_all(&manifest)?;

        for tensor in self.encoder.tensors.iter().chain(&self.head.tensors) {
            for value in &tensor.data {
                file.write_all(&value.to_le_bytes())?;
            }
        }
        file.flush()?;

        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut file = BufReader::new(file);
        let mut magic = [0_u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(CheckpointError::InvalidFormat("bad magic".to_string()));
        }

        let version = read_u32(&mut file)?;
        if version != VERSION {
            return Err(CheckpointError::InvalidFormat(format!(
                "unsupported version {version}"
            )));
        }

        let manifest_len = read_u32(&mut file)? as usize;
        let mut manifest_bytes = vec![0_u8; manifest_len];
        file.read_exact(&mut manifest_bytes)?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;

        let mut remaining = file_len.saturating_sub(12 + manifest_len as u64);
        let encoder = read_section(&mut file, manifest.encoder, &mut remaining)?;
        let head = read_section(&mut file, manifest.head, &mut remaining)?;

        let mut trailing = [0_u8; 1];
        if file.read(&mut trailing)? != 0 {
            return Err(CheckpointError::InvalidFormat(
                "trailing bytes after parameter data".to_string(),
            ));
        }

        Ok(Self { encoder, head })
    }
}

/// `remaining` is the number of payload bytes left in the file; a manifest
/// claiming more than that is rejected before anything is allocated.
fn read_section(
    reader: &mut dyn Read,
    specs: Vec<TensorSpec>,
    remaining: &mut u64,
) -> Result<StateDict, CheckpointError> {
    let mut tensors = Vec::with_capacity(specs.len());
    for spec in specs {
        let bytes = spec
            .rows
            .checked_mul(spec.cols)
            .and_then(|len| (len as u64).checked_mul(8))
            .filter(|bytes| *bytes <= *remaining)
            .ok_or_else(|| {
                CheckpointError::InvalidFormat(format!(
                    "{} claims {}x{} values, more than the file holds",
                    spec.name, spec.rows, spec.cols
                ))
            })?;
        *remaining -= bytes;
        let len = spec.rows * spec.cols;
        let mut data = Vec::with_capacity(len);
        for _ in 0..len {
            data.push(read_f64(reader)?);
        }
        tensors.push(NamedTensor { spec, data });
    }
    Ok(StateDict { tensors })
}

fn read_u32(reader: &mut dyn Read) -> Result<u32, CheckpointError> {
    let mut bytes = [0_u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_f64(reader: &mut dyn Read) -> Result<f64, CheckpointError> {
    let mut bytes = [0_u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(f64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{Param, Rng};

    fn sample_state(seed: u64) -> (Tape, Vec<(String, usize)>) {
        let mut tape = Tape::new();
        let mut rng = Rng::new(seed);
        let w = tape.add_param(Param::matrix(&mut rng, 3, 2, 1.0));
        let b = tape.add_param(Param::matrix(&mut rng, 1, 3, 1.0));
        (tape, vec![("fc.weight".to_string(), w), ("fc.bias".to_string(), b)])
    }

    #[test]
    fn save_load_preserves_bits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ckpt.pth");
        let (tape, named) = sample_state(5);
        let checkpoint = Checkpoint {
            encoder: StateDict::capture(&named, &tape),
            head: StateDict::capture(&named[..1], &tape),
        };
        checkpoint.save(&path).expect("save");

        let loaded = Checkpoint::load(&path).expect("load");
        assert_eq!(loaded, checkpoint);
        for (a, b) in loaded.encoder.tensors.iter().zip(&checkpoint.encoder.tensors) {
            let bits_a = a.data.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
            let bits_b = b.data.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
            assert_eq!(bits_a, bits_b);
        }
    }

    #[test]
    fn apply_rejects_shape_mismatch_without_partial_write() {
        let (source, named) = sample_state(1);
        let state = StateDict::capture(&named, &source);

        let mut target = Tape::new();
        let mut rng = Rng::new(2);
        let w = target.add_param(Param::matrix(&mut rng, 3, 2, 1.0));
        let b = target.add_param(Param::matrix(&mut rng, 1, 4, 1.0));
        let before = target.params()[w].data.clone();
        let target_named = vec![("fc.weight".to_string(), w), ("fc.bias".to_string(), b)];

        let err = state
            .apply("encoder", &target_named, &mut target)
            .expect_err("mismatch");
        assert!(matches!(err, CheckpointError::StateMismatch { .. }));
        assert_eq!(target.params()[w].data, before);
    }

    #[test]
    fn apply_rejects_unknown_keys() {
        let (source, named) = sample_state(1);
        let state = StateDict::capture(&named, &source);
        let (mut target, _) = sample_state(9);
        let renamed = vec![("fc.weight".to_string(), 0), ("proj.bias".to_string(), 1)];

        let err = state.apply("head", &renamed, &mut target).expect_err("mismatch");
        match err {
            CheckpointError::StateMismatch { module, detail } => {
                assert_eq!(module, "head");
                assert!(detail.contains("proj.bias"), "{detail}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn load_rejects_foreign_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("junk.pth");
        std::fs::write(&path, b"PK\x03\x04not a checkpoint").expect("write");
        let err = Checkpoint::load(&path).expect_err("bad magic");
        assert!(matches!(err, CheckpointError::InvalidFormat(_)));
    }

    fn write_raw(path: &Path, manifest: &serde_json::Value, payload: &[u8]) {
        let manifest = serde_json::to_vec(manifest).expect("manifest");
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&(manifest.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&manifest);
        bytes.extend_from_slice(payload);
        std::fs::write(path, bytes).expect("write");
    }

    #[test]
    fn load_rejects_oversized_manifest_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("huge.pth");
        let cases = [
            (u64::MAX, 2_u64),
            (1 << 40, 1 << 20),
            (4, 4),
        ];
        for (rows, cols) in cases {
            let manifest = serde_json::json!({
                "encoder": [{ "name": "fc.weight", "rows": rows, "cols": cols }],
                "head": [],
            });
            write_raw(&path, &manifest, &[0_u8; 8 * 3]);
            let err = Checkpoint::load(&path).expect_err("oversized");
            assert!(
                matches!(&err, CheckpointError::InvalidFormat(msg) if msg.contains("fc.weight")),
                "{rows}x{cols}: {err:?}"
            );
        }
    }
}
