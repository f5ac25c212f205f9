use std::fs;
use std::path::Path;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::config::{ModelConfig, ParallelConfig};
use crate::error::{ReshardError, Result};
use crate::pipeline::{LayerAssignment, StageLayers, to_global};
use crate::retry::RetryPolicy;
use crate::sharding::ShardCoord;
use crate::tensor::{DType, checked_byte_len};

/// Archive format version written by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Name of the manifest inside an archive directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Blob file name of the shard at `(tensor_rank, pipeline_rank)`.
pub fn shard_file_name(tensor_rank: usize, pipeline_rank: usize) -> String {
    format!("tp{tensor_rank:02}_pp{pipeline_rank:03}.bin")
}

/// One tensor stored in a shard blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterEntry {
    /// Parameter name, with stage-local layer indices.
    pub name: String,
    /// Element type.
    pub dtype: DType,
    /// Shape of this shard's slice.
    pub shape: Vec<usize>,
}

impl ParameterEntry {
    /// Bytes occupied by the tensor, excluding alignment padding. `None` when the
    /// declared shape is too large to address.
    pub fn num_bytes(&self) -> Option<u64> {
        checked_byte_len(self.dtype, &self.shape).and_then(|len| u64::try_from(len).ok())
    }
}

/// Manifest entry of one shard blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    /// Tensor-parallel rank.
    pub tensor_rank: usize,
    /// Pipeline rank.
    pub pipeline_rank: usize,
    /// Blob file name, relative to the archive root.
    pub file_name: String,
    /// Exact blob length in bytes.
    pub byte_len: u64,
    /// Global layer ranges held by this shard's stage.
    pub layers: StageLayers,
    /// Stored tensors, in blob order.
    pub parameters: Vec<ParameterEntry>,
}

impl ShardDescriptor {
    /// Coordinates of the shard.
    pub fn coord(&self) -> ShardCoord {
        ShardCoord::new(self.tensor_rank, self.pipeline_rank)
    }

    /// Byte offset of every parameter, followed by the blob length they imply, or `None`
    /// when the layout overflows.
    ///
    /// Each tensor starts at a multiple of its element size.
    pub fn offsets(&self) -> Option<(Vec<u64>, u64)> {
        let mut offsets = Vec::with_capacity(self.parameters.len());
        let mut end = 0u64;
        for entry in &self.parameters {
            let start = end.checked_next_multiple_of(entry.dtype.size() as u64)?;
            offsets.push(start);
            end = start.checked_add(entry.num_bytes()?)?;
        }
        Some((offsets, end))
    }

    /// Offset and entry of a parameter.
    pub fn locate(&self, name: &str) -> Option<(u64, &ParameterEntry)> {
        let index = self.parameters.iter().position(|p| p.name == name)?;
        let (offsets, _) = self.offsets()?;
        Some((offsets[index], &self.parameters[index]))
    }
}

/// Contents of `manifest.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Archive format version.
    pub format_version: u32,
    /// Layout the archive was written with.
    pub parallel_config: ParallelConfig,
    /// Architecture hyperparameters.
    pub model_config: ModelConfig,
    /// Shards, pipeline-major then tensor rank.
    pub shards: Vec<ShardDescriptor>,
}

#[derive(Deserialize)]
struct VersionProbe {
    format_version: u32,
}

impl Manifest {
    /// Reads `manifest.json` from an archive root.
    ///
    /// The format version is checked before the rest of the document is interpreted.
    pub fn read(root: &Path, retry: &RetryPolicy) -> Result<Self> {
        let path = root.join(MANIFEST_FILE);
        let text = retry.run(&path, || fs::read_to_string(&path))?;

        let probe: VersionProbe = serde_json::from_str(&text)
            .map_err(|err| ReshardError::corrupt(&path, format!("unreadable manifest: {err}")))?;
        if probe.format_version != FORMAT_VERSION {
            return Err(ReshardError::ArchiveIncompatible {
                found: probe.format_version,
                supported: FORMAT_VERSION,
            });
        }

        serde_json::from_str(&text)
            .map_err(|err| ReshardError::corrupt(&path, format!("malformed manifest: {err}")))
    }

    /// Writes `manifest.json` into `dir` and syncs it.
    pub(crate) fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let text = serde_json::to_vec_pretty(self)
            .map_err(|err| ReshardError::io(&path, err.into()))?;
        fs::write(&path, text).map_err(|err| ReshardError::io(&path, err))?;
        fs::File::open(&path)
            .and_then(|file| file.sync_all())
            .map_err(|err| ReshardError::io(&path, err))
    }

    /// Descriptor of the shard at the given coordinates.
    pub fn shard(&self, tensor_rank: usize, pipeline_rank: usize) -> Option<&ShardDescriptor> {
        self.shards
            .iter()
            .find(|s| s.tensor_rank == tensor_rank && s.pipeline_rank == pipeline_rank)
    }

    /// Descriptors of one pipeline stage, in tensor-rank order.
    pub fn stage(&self, pipeline_rank: usize) -> impl Iterator<Item = &ShardDescriptor> {
        self.shards
            .iter()
            .filter(move |s| s.pipeline_rank == pipeline_rank)
    }

    /// Total bytes over all blobs.
    pub fn total_bytes(&self) -> u64 {
        self.shards
            .iter()
            .fold(0, |total: u64, s| total.saturating_add(s.byte_len))
    }

    /// Checks the manifest for internal consistency and returns the layer assignment it
    /// declares. `root` is only used for error messages.
    pub fn validate(&self, root: &Path) -> Result<LayerAssignment> {
        let corrupt = |reason: String| ReshardError::corrupt(root, reason);
        let config = &self.parallel_config;

        config
            .validate()
            .and_then(|_| self.model_config.validate())
            .map_err(|err| corrupt(format!("declared configuration is invalid: {err}")))?;

        let mut seen = HashSet::new();
        for shard in &self.shards {
            if !seen.insert(shard.coord()) {
                return Err(corrupt(format!(
                    "duplicate shard at tensor rank {} pipeline rank {}",
                    shard.tensor_rank, shard.pipeline_rank
                )));
            }
        }
        let mesh = config.mesh().map_err(|err| corrupt(err.to_string()))?;
        for coord in mesh.iter() {
            if !seen.contains(coord) {
                return Err(corrupt(format!(
                    "missing shard at tensor rank {} pipeline rank {}",
                    coord.tensor_rank, coord.pipeline_rank
                )));
            }
        }
        if self.shards.len() != mesh.len() {
            return Err(corrupt(format!(
                "{} shards declared but layout {config} has {}",
                self.shards.len(),
                mesh.len()
            )));
        }
        if !mesh.iter().zip(&self.shards).all(|(c, s)| *c == s.coord()) {
            return Err(corrupt(
                "shards are not ordered pipeline-major then tensor rank".to_string(),
            ));
        }

        for shard in &self.shards {
            self.validate_shard(shard).map_err(&corrupt)?;
        }

        let stages = (0..config.pipeline_parallel_size)
            .map(|rank| self.stage_consistency(rank).map_err(&corrupt))
            .collect::<Result<Vec<_>>>()?;
        LayerAssignment::from_stages(stages, &self.model_config)
            .map_err(|err| corrupt(format!("layer ranges are inconsistent: {err}")))
    }

    fn validate_shard(&self, shard: &ShardDescriptor) -> core::result::Result<(), String> {
        let file_name = Path::new(&shard.file_name);
        if file_name.file_name() != Some(file_name.as_os_str()) {
            return Err(format!("shard file name `{}` is not a plain file name", shard.file_name));
        }

        let Some((_, byte_len)) = shard.offsets() else {
            return Err(format!(
                "parameter sizes of shard `{}` overflow the addressable range",
                shard.file_name
            ));
        };
        if byte_len != shard.byte_len {
            return Err(format!(
                "shard `{}` declares {} bytes but its parameters occupy {byte_len}",
                shard.file_name, shard.byte_len
            ));
        }

        let mut names = HashSet::new();
        for entry in &shard.parameters {
            if !names.insert(entry.name.as_str()) {
                return Err(format!(
                    "parameter `{}` appears twice in shard `{}`",
                    entry.name, shard.file_name
                ));
            }
            if to_global(&entry.name, &shard.layers).is_none() {
                return Err(format!(
                    "parameter `{}` in shard `{}` names a layer outside the stage",
                    entry.name, shard.file_name
                ));
            }
        }
        Ok(())
    }

    /// Checks that every tensor rank of a stage holds the same parameters and layers.
    fn stage_consistency(&self, pipeline_rank: usize) -> core::result::Result<StageLayers, String> {
        let mut stage = self.stage(pipeline_rank);
        let first = stage
            .next()
            .ok_or_else(|| format!("pipeline rank {pipeline_rank} has no shards"))?;

        for other in stage {
            if other.layers != first.layers {
                return Err(format!(
                    "tensor ranks 0 and {} of pipeline rank {pipeline_rank} disagree on layer ranges",
                    other.tensor_rank
                ));
            }
            let same_parameters = other.parameters.len() == first.parameters.len()
                && other
                    .parameters
                    .iter()
                    .zip(&first.parameters)
                    .all(|(a, b)| a.name == b.name && a.dtype == b.dtype);
            if !same_parameters {
                return Err(format!(
                    "tensor ranks 0 and {} of pipeline rank {pipeline_rank} hold different parameters",
                    other.tensor_rank
                ));
            }
        }
        Ok(first.layers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, dtype: DType, shape: Vec<usize>) -> ParameterEntry {
        ParameterEntry {
            name: name.to_string(),
            dtype,
            shape,
        }
    }

    fn manifest() -> Manifest {
        let model = ModelConfig {
            num_layers: 2,
            num_decoder_layers: None,
            hidden_size: 4,
            num_attention_heads: 2,
            vocab_size: 8,
        };
        let shards = [(0, 0..1), (1, 1..2)]
            .into_iter()
            .map(|(pp, layers)| ShardDescriptor {
                tensor_rank: 0,
                pipeline_rank: pp,
                file_name: shard_file_name(0, pp),
                byte_len: 16,
                layers: StageLayers {
                    encoder: layers,
                    decoder: 0..0,
                },
                parameters: vec![entry(
                    "encoder.layers.0.input_layernorm.weight",
                    DType::F32,
                    vec![4],
                )],
            })
            .collect();
        Manifest {
            format_version: FORMAT_VERSION,
            parallel_config: ParallelConfig::new(1, 2),
            model_config: model,
            shards,
        }
    }

    #[test]
    fn test_shard_file_name() {
        assert_eq!(shard_file_name(1, 12), "tp01_pp012.bin");
    }

    #[test]
    fn test_offsets_are_naturally_aligned() {
        let shard = ShardDescriptor {
            tensor_rank: 0,
            pipeline_rank: 0,
            file_name: shard_file_name(0, 0),
            byte_len: 0,
            layers: StageLayers::default(),
            parameters: vec![
                entry("a", DType::U8, vec![3]),
                entry("b", DType::F32, vec![2]),
                entry("c", DType::F16, vec![1]),
                entry("d", DType::F64, vec![1]),
            ],
        };

        let (offsets, len) = shard.offsets().unwrap();
        assert_eq!(offsets, vec![0, 4, 12, 16]);
        assert_eq!(len, 24);
        assert_eq!(shard.locate("c").map(|(offset, _)| offset), Some(12));
        assert!(shard.locate("z").is_none());
    }

    #[test]
    fn test_valid_manifest() {
        let assignment = manifest().validate(Path::new("ckpt")).unwrap();

        assert_eq!(assignment.stage(1).unwrap().encoder, 1..2);
    }

    #[test]
    #[should_panic = "duplicate shard at tensor rank 0 pipeline rank 0"]
    fn test_duplicate_coordinates() {
        let mut manifest = manifest();
        manifest.shards[1].pipeline_rank = 0;
        manifest.validate(Path::new("ckpt")).unwrap();
    }

    #[test]
    #[should_panic = "declares 20 bytes but its parameters occupy 16"]
    fn test_byte_len_mismatch() {
        let mut manifest = manifest();
        manifest.shards[0].byte_len = 20;
        manifest.validate(Path::new("ckpt")).unwrap();
    }

    #[test]
    fn test_oversized_shape_is_corrupt() {
        let mut manifest = manifest();
        manifest.shards[0].parameters[0].shape = vec![1 << 32, 1 << 32];

        let err = manifest.validate(Path::new("ckpt")).unwrap_err();

        assert!(matches!(err, ReshardError::ArchiveCorrupt { .. }));
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn test_offsets_overflow_across_parameters() {
        let mut shard = manifest().shards.remove(0);
        shard.parameters = vec![
            entry("a", DType::U8, vec![usize::MAX]),
            entry("b", DType::F32, vec![1]),
        ];

        assert_eq!(shard.offsets(), None);
        assert_eq!(shard.locate("b"), None);
    }

    #[test]
    #[should_panic = "names a layer outside the stage"]
    fn test_local_index_outside_stage() {
        let mut manifest = manifest();
        manifest.shards[1].parameters[0].name = "encoder.layers.1.input_layernorm.weight".into();
        manifest.validate(Path::new("ckpt")).unwrap();
    }

    #[test]
    #[should_panic = "layer ranges are inconsistent"]
    fn test_layer_gap() {
        let mut manifest = manifest();
        manifest.shards[1].layers.encoder = 2..3;
        manifest.shards[1].parameters.clear();
        manifest.shards[1].byte_len = 0;
        manifest.validate(Path::new("ckpt")).unwrap();
    }

    #[test]
    fn test_path_in_file_name_is_rejected() {
        let mut manifest = manifest();
        manifest.shards[0].file_name = "../escape.bin".into();
        let err = manifest.validate(Path::new("ckpt")).unwrap_err();

        assert!(matches!(err, ReshardError::ArchiveCorrupt { .. }));
    }

    #[test]
    fn test_read_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = manifest();
        manifest.format_version = 2;
        fs::write(
            dir.path().join(MANIFEST_FILE),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();

        let err = Manifest::read(dir.path(), &RetryPolicy::none()).unwrap_err();
        assert!(matches!(
            err,
            ReshardError::ArchiveIncompatible {
                found: 2,
                supported: 1
            }
        ));
    }

    #[test]
    fn test_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        manifest().write(dir.path()).unwrap();

        let read = Manifest::read(dir.path(), &RetryPolicy::none()).unwrap();
        pretty_assertions::assert_eq!(read, manifest());
    }
}
