use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashSet;
use tempfile::TempDir;

use crate::checkpoint::Checkpoint;
use crate::config::{ModelConfig, ParallelConfig};
use crate::error::{ReshardError, Result};
use crate::pipeline::LayerAssignment;
use crate::tensor::TensorData;

use super::lock::{OutputGuard, parent_dir};
use super::manifest::{FORMAT_VERSION, Manifest, ParameterEntry, ShardDescriptor, shard_file_name};

const STAGING_PREFIX: &str = ".reshard-staging-";

#[derive(Debug)]
struct Blob {
    path: PathBuf,
    file: BufWriter<File>,
    names: HashSet<String>,
}

/// Writes a new archive into a hidden staging directory and publishes it atomically.
///
/// Nothing is visible at the output path until [`commit`](Self::commit) succeeds.
/// Dropping the writer discards the staging directory.
#[derive(Debug)]
pub struct ArchiveWriter {
    output: PathBuf,
    staging: TempDir,
    manifest: Manifest,
    blobs: Vec<Option<Blob>>,
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn check_absent(output: &Path) -> Result<()> {
    match fs::symlink_metadata(output) {
        Ok(_) => Err(ReshardError::OutputExists {
            path: output.to_path_buf(),
        }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ReshardError::io(output, err)),
    }
}

impl ArchiveWriter {
    /// Starts an archive for `parallel_config`, with layer ranges from `assignment`.
    ///
    /// Fails with [`ReshardError::OutputExists`] if `output` is already present.
    pub fn create<P: AsRef<Path>>(
        output: P,
        parallel_config: ParallelConfig,
        model_config: ModelConfig,
        assignment: &LayerAssignment,
    ) -> Result<Self> {
        let output = output.as_ref().to_path_buf();
        check_absent(&output)?;
        let mesh = parallel_config.mesh()?;
        if assignment.num_stages() != parallel_config.pipeline_parallel_size {
            return Err(ReshardError::InvalidConfig(format!(
                "layer assignment has {} stages but layout {parallel_config} needs {}",
                assignment.num_stages(),
                parallel_config.pipeline_parallel_size
            )));
        }

        let parent = parent_dir(&output);
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&parent)
            .map_err(|err| ReshardError::io(&parent, err))?;

        let shards: Vec<ShardDescriptor> = mesh
            .iter()
            .map(|coord| ShardDescriptor {
                tensor_rank: coord.tensor_rank,
                pipeline_rank: coord.pipeline_rank,
                file_name: shard_file_name(coord.tensor_rank, coord.pipeline_rank),
                byte_len: 0,
                layers: assignment.stages()[coord.pipeline_rank].clone(),
                parameters: Vec::new(),
            })
            .collect();
        let blobs = shards.iter().map(|_| None).collect();

        log::debug!(
            "Staging {} in {}",
            output.display(),
            staging.path().display()
        );
        Ok(Self {
            output,
            staging,
            manifest: Manifest {
                format_version: FORMAT_VERSION,
                parallel_config,
                model_config,
                shards,
            },
            blobs,
        })
    }

    /// Final path of the archive.
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Directory the archive is being assembled in.
    pub fn staging_path(&self) -> &Path {
        self.staging.path()
    }

    fn index(&self, tensor_rank: usize, pipeline_rank: usize) -> Result<usize> {
        let config = &self.manifest.parallel_config;
        if tensor_rank >= config.tensor_parallel_size || pipeline_rank >= config.pipeline_parallel_size {
            return Err(ReshardError::InvalidConfig(format!(
                "no shard at tensor rank {tensor_rank} pipeline rank {pipeline_rank} in layout {config}"
            )));
        }
        Ok(pipeline_rank * config.tensor_parallel_size + tensor_rank)
    }

    fn open_blob(dir: &Path, file_name: &str) -> Result<Blob> {
        let path = dir.join(file_name);
        let file = File::create(&path).map_err(|err| ReshardError::io(&path, err))?;
        Ok(Blob {
            path,
            file: BufWriter::new(file),
            names: HashSet::new(),
        })
    }

    /// Appends one tensor to the shard at `(tensor_rank, pipeline_rank)`.
    ///
    /// `name` is the stored name, with stage-local layer indices.
    pub fn append(
        &mut self,
        tensor_rank: usize,
        pipeline_rank: usize,
        name: &str,
        tensor: &TensorData,
    ) -> Result<()> {
        let index = self.index(tensor_rank, pipeline_rank)?;
        let blob = match &mut self.blobs[index] {
            Some(blob) => blob,
            slot @ None => slot.insert(Self::open_blob(
                self.staging.path(),
                &self.manifest.shards[index].file_name,
            )?),
        };
        let shard = &mut self.manifest.shards[index];
        if !blob.names.insert(name.to_string()) {
            return Err(ReshardError::InvalidConfig(format!(
                "parameter `{name}` written twice to shard `{}`",
                shard.file_name
            )));
        }

        let offset = shard.byte_len.next_multiple_of(tensor.dtype().size() as u64);
        let gap = (offset - shard.byte_len) as usize;
        blob.file
            .write_all(&[0u8; 8][..gap])
            .and_then(|_| blob.file.write_all(tensor.bytes()))
            .map_err(|err| ReshardError::io(&blob.path, err))?;

        shard.byte_len = offset + tensor.num_bytes() as u64;
        shard.parameters.push(ParameterEntry {
            name: name.to_string(),
            dtype: tensor.dtype(),
            shape: tensor.shape().to_vec(),
        });
        Ok(())
    }

    /// Flushes every blob, writes the manifest and renames the staging directory to the
    /// output path.
    pub fn commit(mut self) -> Result<Manifest> {
        for index in 0..self.blobs.len() {
            let blob = match self.blobs[index].take() {
                Some(blob) => blob,
                None => Self::open_blob(self.staging.path(), &self.manifest.shards[index].file_name)?,
            };
            let Blob { path, file, .. } = blob;
            file.into_inner()
                .map_err(|err| err.into_error())
                .and_then(|file| file.sync_all())
                .map_err(|err| ReshardError::io(&path, err))?;
        }

        let staging = self.staging.path().to_path_buf();
        self.manifest.validate(&staging)?;
        self.manifest.write(&staging)?;
        sync_dir(&staging).map_err(|err| ReshardError::io(&staging, err))?;

        check_absent(&self.output)?;
        let staged = self.staging.keep();
        if let Err(err) = fs::rename(&staged, &self.output) {
            let _ = fs::remove_dir_all(&staged);
            return Err(ReshardError::io(&self.output, err));
        }
        let parent = parent_dir(&self.output);
        sync_dir(&parent).map_err(|err| ReshardError::io(&parent, err))?;

        log::info!(
            "Committed {} ({} shards, {} bytes)",
            self.output.display(),
            self.manifest.shards.len(),
            self.manifest.total_bytes()
        );
        Ok(self.manifest)
    }
}

/// Writes an in-memory checkpoint as a new archive at `output`.
pub fn write_checkpoint<P: AsRef<Path>>(checkpoint: &Checkpoint, output: P) -> Result<Manifest> {
    let output = output.as_ref();
    let _guard = OutputGuard::acquire(output)?;
    let assignment = checkpoint.validate()?;

    let mut writer = ArchiveWriter::create(
        output,
        checkpoint.parallel_config,
        checkpoint.model_config.clone(),
        &assignment,
    )?;
    for shard in &checkpoint.shards {
        for (name, tensor) in &shard.parameters {
            writer.append(shard.tensor_rank, shard.pipeline_rank, name, tensor)?;
        }
    }
    writer.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveReader, MANIFEST_FILE};
    use crate::checkpoint::Shard;
    use crate::tensor::DType;

    fn model() -> ModelConfig {
        ModelConfig {
            num_layers: 2,
            num_decoder_layers: None,
            hidden_size: 2,
            num_attention_heads: 1,
            vocab_size: 4,
        }
    }

    fn checkpoint() -> Checkpoint {
        let mut first = Shard::new(0, 0);
        first.push(
            "embedding.word_embeddings.weight",
            TensorData::from_f32(vec![4, 2], &[0., 1., 2., 3., 4., 5., 6., 7.]),
        );
        first.push(
            "encoder.layers.0.input_layernorm.weight",
            TensorData::new(DType::U8, vec![3], vec![1, 2, 3]).unwrap(),
        );
        first.push(
            "encoder.layers.0.input_layernorm.bias",
            TensorData::new(DType::F64, vec![1], 2.5f64.to_le_bytes().to_vec()).unwrap(),
        );
        let mut second = Shard::new(0, 1);
        second.push(
            "encoder.layers.0.input_layernorm.weight",
            TensorData::from_f32(vec![2], &[1., 1.]),
        );
        Checkpoint {
            parallel_config: ParallelConfig::new(1, 2),
            model_config: model(),
            shards: vec![first, second],
        }
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("ckpt");

        let manifest = write_checkpoint(&checkpoint(), &output).unwrap();
        assert_eq!(manifest.shards[0].byte_len, 32 + 3 + 5 + 8);
        assert_eq!(manifest.shards[1].layers.encoder, 1..2);

        let reader = ArchiveReader::open(&output).unwrap();
        pretty_assertions::assert_eq!(reader.load_checkpoint().unwrap(), checkpoint());
        assert_eq!(
            reader
                .read_parameter(0, 0, "encoder.layers.0.input_layernorm.bias")
                .unwrap()
                .bytes(),
            &2.5f64.to_le_bytes()
        );
    }

    #[test]
    fn test_parameter_reads_agree_with_shard_reads() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("ckpt");
        write_checkpoint(&checkpoint(), &output).unwrap();

        let reader = ArchiveReader::open(&output)
            .unwrap()
            .with_read_timeout(std::time::Duration::from_secs(5));
        for (name, tensor) in reader.read_shard(0, 0).unwrap().into_iter().rev() {
            assert_eq!(reader.read_parameter(0, 0, &name).unwrap(), tensor);
        }
        assert!(matches!(
            reader.read_parameter(0, 1, "embedding.word_embeddings.weight"),
            Err(ReshardError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_gap_bytes_are_zero() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("ckpt");
        write_checkpoint(&checkpoint(), &output).unwrap();

        let blob = fs::read(output.join(shard_file_name(0, 0))).unwrap();
        assert_eq!(&blob[32..35], &[1, 2, 3]);
        assert_eq!(&blob[35..40], &[0; 5]);
    }

    #[test]
    fn test_nothing_visible_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("ckpt");
        let assignment = checkpoint().validate().unwrap();

        let mut writer =
            ArchiveWriter::create(&output, ParallelConfig::new(1, 2), model(), &assignment).unwrap();
        writer
            .append(0, 0, "embedding.word_embeddings.weight", &TensorData::zeros(DType::F32, vec![4, 2]))
            .unwrap();
        assert!(!output.exists());
        assert!(writer.staging_path().starts_with(dir.path()));
        drop(writer);

        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_existing_output_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("ckpt");
        fs::create_dir(&output).unwrap();
        fs::write(output.join(MANIFEST_FILE), b"{}").unwrap();

        let err = write_checkpoint(&checkpoint(), &output).unwrap_err();
        assert!(matches!(err, ReshardError::OutputExists { .. }));
        assert_eq!(fs::read(output.join(MANIFEST_FILE)).unwrap(), b"{}");
    }

    #[test]
    fn test_duplicate_append_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let assignment = checkpoint().validate().unwrap();
        let mut writer =
            ArchiveWriter::create(dir.path().join("ckpt"), ParallelConfig::new(1, 2), model(), &assignment)
                .unwrap();
        let tensor = TensorData::zeros(DType::F32, vec![2]);

        writer.append(0, 1, "encoder.layers.0.input_layernorm.bias", &tensor).unwrap();
        let err = writer
            .append(0, 1, "encoder.layers.0.input_layernorm.bias", &tensor)
            .unwrap_err();
        assert!(err.to_string().contains("written twice"));
        assert!(writer.append(1, 0, "x", &tensor).is_err());
    }
}
