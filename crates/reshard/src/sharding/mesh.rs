use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of one mesh axis.
///
/// Checkpoints use two dimensions, [`MeshDim::pipeline`] and [`MeshDim::tensor`], but the
/// mesh itself places no restriction on names beyond uniqueness.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct MeshDim {
    name: String,
}

impl MeshDim {
    /// A dimension called `name`.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }

    /// The pipeline-parallel dimension.
    pub fn pipeline() -> Self {
        Self::new("pipeline")
    }

    /// The tensor-parallel dimension.
    pub fn tensor() -> Self {
        Self::new("tensor")
    }

    /// The dimension name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Coordinates of one checkpoint shard.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardCoord {
    /// Pipeline rank.
    pub pipeline_rank: usize,
    /// Tensor-parallel rank.
    pub tensor_rank: usize,
}

impl ShardCoord {
    /// Creates a coordinate.
    pub fn new(tensor_rank: usize, pipeline_rank: usize) -> Self {
        Self {
            pipeline_rank,
            tensor_rank,
        }
    }
}

/// Named, N-dimensional arrangement of elements stored in row-major order.
///
/// For a checkpoint the mesh is `[pipeline, tensor]` and its elements are
/// [`ShardCoord`]s, so iterating it yields shards pipeline-major, the order archive
/// manifests use.
#[derive(Clone, Debug)]
pub struct DeviceMesh<T> {
    devices: Vec<T>,
    shape: Vec<usize>,
    /// Axis index of every named dimension.
    dims: HashMap<MeshDim, usize>,
}

impl<T> DeviceMesh<T> {
    /// Shape of the mesh.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements in the mesh.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the mesh has no elements.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Size of the named dimension, if the mesh has it.
    pub fn dim_size(&self, dim: &MeshDim) -> Option<usize> {
        self.dims.get(dim).map(|&idx| self.shape[idx])
    }

    /// Element at a multi-dimensional index.
    pub fn get(&self, index: &[usize]) -> Option<&T> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut flat = 0;
        for (&i, &extent) in index.iter().zip(self.shape.iter()) {
            if i >= extent {
                return None;
            }
            flat = flat * extent + i;
        }
        self.devices.get(flat)
    }

    /// Iterates the elements in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.devices.iter()
    }
}

/// Errors raised while assembling a [`DeviceMesh`].
#[derive(Debug, Error)]
pub enum DeviceMeshError {
    /// A dimension index is out of range or mapped twice.
    #[error("invalid mesh dimension: {0}")]
    InvalidDimension(String),
    /// Shape and element count disagree, or a dimension is left unnamed.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
}

/// Assembles a [`DeviceMesh`] from row-major elements, a shape and named dimensions.
#[derive(Clone, Debug)]
pub struct DeviceMeshBuilder<T> {
    devices: Vec<T>,
    shape: Vec<usize>,
    dims: HashMap<MeshDim, usize>,
}

impl<T> DeviceMeshBuilder<T> {
    /// Starts a mesh of `shape` over `devices`, given in row-major order.
    pub fn new<S: Into<Vec<usize>>>(devices: Vec<T>, shape: S) -> Self {
        Self {
            devices,
            shape: shape.into(),
            dims: HashMap::new(),
        }
    }

    /// Names the mesh axis at `idx`.
    ///
    /// Every axis must be named exactly once, with distinct names; this is checked by
    /// [`build`](Self::build).
    ///
    /// # Example
    ///
    /// ```rust
    /// use reshard::sharding::{DeviceMeshBuilder, MeshDim};
    ///
    /// let mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
    ///     .with_dim(0, MeshDim::pipeline())
    ///     .with_dim(1, MeshDim::tensor())
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(mesh.get(&[1, 0]), Some(&2));
    /// ```
    pub fn with_dim(mut self, idx: usize, dim: MeshDim) -> Self {
        self.dims.insert(dim, idx);
        self
    }

    fn check_dims(&self) -> Result<(), DeviceMeshError> {
        let rank = self.shape.len();
        let mut mapped = HashSet::with_capacity(rank);
        for (dim, &idx) in &self.dims {
            if idx >= rank {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "`{}` is mapped to axis {idx} of a {rank}-d mesh",
                    dim.name
                )));
            }
            if !mapped.insert(idx) {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "axis {idx} is named more than once"
                )));
            }
        }
        if mapped.len() != rank {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "{} of {rank} axes are named",
                mapped.len()
            )));
        }
        Ok(())
    }

    /// Validates the configuration and builds the mesh.
    pub fn build(self) -> Result<DeviceMesh<T>, DeviceMeshError> {
        self.check_dims()?;

        if self.shape.contains(&0) {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "shape {:?} has an empty axis",
                self.shape
            )));
        }
        let expected = self.shape.iter().product::<usize>();
        if self.devices.len() != expected {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "{} elements cannot fill shape {:?}",
                self.devices.len(),
                self.shape
            )));
        }

        Ok(DeviceMesh {
            devices: self.devices,
            shape: self.shape,
            dims: self.dims,
        })
    }
}

/// Builds the `[pipeline, tensor]` mesh of shard coordinates for a layout.
pub fn shard_mesh(
    tensor_parallel_size: usize,
    pipeline_parallel_size: usize,
) -> Result<DeviceMesh<ShardCoord>, DeviceMeshError> {
    let coords = (0..pipeline_parallel_size)
        .flat_map(|pp| (0..tensor_parallel_size).map(move |tp| ShardCoord::new(tp, pp)))
        .collect();

    DeviceMeshBuilder::new(coords, [pipeline_parallel_size, tensor_parallel_size])
        .with_dim(0, MeshDim::pipeline())
        .with_dim(1, MeshDim::tensor())
        .build()
}
