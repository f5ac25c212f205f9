use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use hashbrown::HashMap;

use crate::catalog::ParameterCatalog;
use crate::checkpoint::{Checkpoint, Shard};
use crate::engine::ReshardEngine;
use crate::error::{ReshardError, Result};
use crate::pipeline::{LayerAssignment, to_global};
use crate::retry::{RetryPolicy, with_deadline};
use crate::tensor::{TensorData, checked_byte_len};

use super::manifest::{Manifest, ParameterEntry, ShardDescriptor};

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Where each parameter of one shard lives in its blob.
#[derive(Debug)]
struct ShardIndex {
    /// Offset and length per parameter, in manifest order.
    extents: Vec<(u64, usize)>,
    positions: HashMap<String, usize>,
}

impl ShardIndex {
    fn build(root: &Path, shard: &ShardDescriptor) -> Result<Self> {
        let overflow = || {
            ReshardError::corrupt(
                root.join(&shard.file_name),
                "parameter sizes overflow the addressable range",
            )
        };
        let (offsets, _) = shard.offsets().ok_or_else(overflow)?;
        let extents = shard
            .parameters
            .iter()
            .zip(offsets)
            .map(|(entry, offset)| {
                let len = checked_byte_len(entry.dtype, &entry.shape).ok_or_else(overflow)?;
                Ok((offset, len))
            })
            .collect::<Result<Vec<_>>>()?;
        let positions = shard
            .parameters
            .iter()
            .enumerate()
            .map(|(position, entry)| (entry.name.clone(), position))
            .collect();
        Ok(Self { extents, positions })
    }
}

/// Read access to a validated archive.
///
/// Opening checks the manifest and the length of every blob; tensors are then read one
/// parameter (or one shard) at a time. Every blob read runs under a deadline.
#[derive(Debug)]
pub struct ArchiveReader {
    root: PathBuf,
    manifest: Manifest,
    assignment: LayerAssignment,
    retry: RetryPolicy,
    read_timeout: Duration,
    index: Vec<ShardIndex>,
}

impl ArchiveReader {
    /// Opens an archive with the default retry policy.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::open_with(root, RetryPolicy::default())
    }

    /// Opens an archive, retrying transient read failures with `retry`.
    pub fn open_with<P: AsRef<Path>>(root: P, retry: RetryPolicy) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let manifest = Manifest::read(&root, &retry)?;
        let assignment = manifest.validate(&root)?;

        for shard in &manifest.shards {
            let path = root.join(&shard.file_name);
            let len = match retry.run(&path, || fs::metadata(&path)) {
                Ok(meta) => meta.len(),
                Err(ReshardError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                    return Err(ReshardError::corrupt(&path, "shard blob is missing"));
                }
                Err(err) => return Err(err),
            };
            if len != shard.byte_len {
                return Err(ReshardError::corrupt(
                    &path,
                    format!("blob is {len} bytes but the manifest declares {}", shard.byte_len),
                ));
            }
        }
        let index = manifest
            .shards
            .iter()
            .map(|shard| ShardIndex::build(&root, shard))
            .collect::<Result<Vec<_>>>()?;

        log::debug!(
            "Opened archive {} ({}, {} shards, {} bytes)",
            root.display(),
            manifest.parallel_config,
            manifest.shards.len(),
            manifest.total_bytes()
        );
        Ok(Self {
            root,
            manifest,
            assignment,
            retry,
            read_timeout: DEFAULT_READ_TIMEOUT,
            index,
        })
    }

    /// Gives up on a single blob read after `timeout`.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Archive root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validated manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Layer assignment declared by the manifest.
    pub fn assignment(&self) -> &LayerAssignment {
        &self.assignment
    }

    fn descriptor(
        &self,
        tensor_rank: usize,
        pipeline_rank: usize,
    ) -> Result<(&ShardDescriptor, &ShardIndex)> {
        self.manifest
            .shards
            .iter()
            .zip(&self.index)
            .find(|(s, _)| s.tensor_rank == tensor_rank && s.pipeline_rank == pipeline_rank)
            .ok_or_else(|| {
                ReshardError::InvalidConfig(format!(
                    "archive has no shard at tensor rank {tensor_rank} pipeline rank {pipeline_rank}"
                ))
            })
    }

    fn decode(path: &Path, entry: &ParameterEntry, bytes: Vec<u8>) -> Result<TensorData> {
        TensorData::new(entry.dtype, entry.shape.clone(), bytes).ok_or_else(|| {
            ReshardError::corrupt(path, format!("parameter `{}` has the wrong length", entry.name))
        })
    }

    /// Reads one parameter of one shard by its stored (stage-local) name.
    pub fn read_parameter(
        &self,
        tensor_rank: usize,
        pipeline_rank: usize,
        name: &str,
    ) -> Result<TensorData> {
        let (shard, index) = self.descriptor(tensor_rank, pipeline_rank)?;
        let position = *index.positions.get(name).ok_or_else(|| {
            ReshardError::InvalidConfig(format!(
                "shard `{}` has no parameter `{name}`",
                shard.file_name
            ))
        })?;
        let entry = &shard.parameters[position];
        let (offset, len) = index.extents[position];
        let path = self.root.join(&shard.file_name);

        let bytes = self
            .retry
            .run(&path, || {
                let path = path.clone();
                with_deadline(self.read_timeout, move || {
                    let mut file = File::open(&path)?;
                    file.seek(SeekFrom::Start(offset))?;
                    let mut bytes = vec![0; len];
                    file.read_exact(&mut bytes)?;
                    Ok(bytes)
                })
            })
            .map_err(|err| match err {
                ReshardError::Io { path, source } if source.kind() == io::ErrorKind::UnexpectedEof => {
                    ReshardError::corrupt(path, format!("blob ends inside parameter `{name}`"))
                }
                err => err,
            })?;
        Self::decode(&path, entry, bytes)
    }

    /// Reads every parameter of one shard, in blob order.
    pub fn read_shard(
        &self,
        tensor_rank: usize,
        pipeline_rank: usize,
    ) -> Result<Vec<(String, TensorData)>> {
        let (shard, index) = self.descriptor(tensor_rank, pipeline_rank)?;
        let path = self.root.join(&shard.file_name);
        let blob = self.retry.run(&path, || {
            let path = path.clone();
            with_deadline(self.read_timeout, move || fs::read(path))
        })?;
        if blob.len() as u64 != shard.byte_len {
            return Err(ReshardError::corrupt(
                &path,
                format!("blob is {} bytes but the manifest declares {}", blob.len(), shard.byte_len),
            ));
        }

        shard
            .parameters
            .iter()
            .zip(&index.extents)
            .map(|(entry, &(offset, len))| {
                let bytes = usize::try_from(offset)
                    .ok()
                    .and_then(|start| blob.get(start..start.checked_add(len)?))
                    .ok_or_else(|| {
                        ReshardError::corrupt(&path, format!("blob ends inside parameter `{}`", entry.name))
                    })?;
                Ok((entry.name.clone(), Self::decode(&path, entry, bytes.to_vec())?))
            })
            .collect()
    }

    /// Loads the whole archive into memory.
    pub fn load_checkpoint(&self) -> Result<Checkpoint> {
        let shards = self
            .manifest
            .shards
            .iter()
            .map(|desc| {
                Ok(Shard {
                    tensor_rank: desc.tensor_rank,
                    pipeline_rank: desc.pipeline_rank,
                    parameters: self.read_shard(desc.tensor_rank, desc.pipeline_rank)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Checkpoint {
            parallel_config: self.manifest.parallel_config,
            model_config: self.manifest.model_config.clone(),
            shards,
        })
    }

    /// Reads every parameter once and checks that its tensor-parallel copies merge.
    ///
    /// Catches shape disagreements between ranks, replicated parameters that are not
    /// identical, and parameters no partition rule knows about. Returns the number of
    /// distinct parameters checked.
    pub fn verify(&self) -> Result<usize> {
        let catalog = ParameterCatalog::megatron(&self.manifest.model_config)?;
        let engine = ReshardEngine::default();
        let tp = self.manifest.parallel_config.tensor_parallel_size;
        let mut checked = 0;

        for pipeline_rank in 0..self.manifest.parallel_config.pipeline_parallel_size {
            let (first, _) = self.descriptor(0, pipeline_rank)?;
            for entry in &first.parameters {
                let global = to_global(&entry.name, &first.layers).ok_or_else(|| {
                    ReshardError::corrupt(
                        &self.root,
                        format!("parameter `{}` lies outside its stage", entry.name),
                    )
                })?;
                let descriptor = catalog.classify(&global)?;
                let copies = (0..tp)
                    .map(|rank| self.read_parameter(rank, pipeline_rank, &entry.name))
                    .collect::<Result<Vec<_>>>()?;
                engine.merge(&global, descriptor.partition, &copies)?;
                checked += 1;
            }
        }

        log::info!(
            "Verified {checked} parameters in {}",
            self.root.display()
        );
        Ok(checked)
    }
}
