//! The decoded cache: a hierarchical HDF5 file persisted beside each
//! trajectory, holding the fully decoded per-feature arrays. Populated on
//! the first read, consulted on every read after that.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use hdf5::types::{FloatSize, IntSize, TypeDescriptor, VarLenUnicode};
use tracing::debug;

use crate::error::CacheError;
use crate::trajectory::TrajectoryData;
use crate::FeatureArray;

/// Handle on one trajectory's decoded cache file.
///
/// The file name derives from a stable hash of the trajectory path, so
/// distinct trajectories sharing a cache directory never collide.
pub(crate) struct DecodedCache {
    path: PathBuf,
}

impl DecodedCache {
    pub(crate) fn new(cache_dir: &Path, trajectory_path: &Path) -> Self {
        let mut hasher = DefaultHasher::new();
        trajectory_path.hash(&mut hasher);
        let path = cache_dir.join(format!("{:x}.cache", hasher.finish()));
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn exists(&self) -> bool {
        self.path.exists()
    }

    pub(crate) fn open(&self) -> Result<hdf5::File, CacheError> {
        Ok(hdf5::File::open(&self.path)?)
    }

    /// Persist the decoded array map. Feature names containing `/` become
    /// nested groups; string arrays store their entries coerced to varlen
    /// unicode.
    pub(crate) fn write(&self, data: &TrajectoryData) -> Result<(), CacheError> {
        let file = hdf5::File::create(&self.path)?;
        for (feature_name, array) in data {
            let (group, leaf) = ensure_groups(&file, feature_name)?;
            debug!(feature = %feature_name, "writing cache dataset");
            match array {
                FeatureArray::Uint8(a) => {
                    group.new_dataset_builder().with_data(a.view()).create(leaf)?;
                }
                FeatureArray::Int32(a) => {
                    group.new_dataset_builder().with_data(a.view()).create(leaf)?;
                }
                FeatureArray::Int64(a) => {
                    group.new_dataset_builder().with_data(a.view()).create(leaf)?;
                }
                FeatureArray::Float32(a) => {
                    group.new_dataset_builder().with_data(a.view()).create(leaf)?;
                }
                FeatureArray::Float64(a) => {
                    group.new_dataset_builder().with_data(a.view()).create(leaf)?;
                }
                FeatureArray::Bool(a) => {
                    group.new_dataset_builder().with_data(a.view()).create(leaf)?;
                }
                FeatureArray::Str(a) => {
                    let coerced =
                        a.mapv(|s| s.parse::<VarLenUnicode>().unwrap_or_default());
                    group
                        .new_dataset_builder()
                        .with_data(coerced.view())
                        .create(leaf)?;
                }
            }
        }
        Ok(())
    }

    /// Materialize the cached hierarchy back into the flat array map:
    /// nested group paths rejoin into `/`-separated feature names, so a
    /// cache-served load equals a container decode key for key.
    pub(crate) fn read(&self) -> Result<TrajectoryData, CacheError> {
        let file = hdf5::File::open(&self.path)?;
        let mut data = BTreeMap::new();
        let root = file.group("/")?;
        read_group(&root, "", &mut data)?;
        Ok(data)
    }
}

/// Create (or reuse) the intermediate groups of a `/`-separated feature
/// name, returning the leaf's parent group and the leaf name.
fn ensure_groups<'n>(
    file: &hdf5::File,
    feature_name: &'n str,
) -> Result<(hdf5::Group, &'n str), CacheError> {
    let mut segments: Vec<&str> = feature_name.split('/').filter(|s| !s.is_empty()).collect();
    let leaf = segments.pop().unwrap_or(feature_name);
    let mut group = file.group("/")?;
    for segment in segments {
        group = match group.group(segment) {
            Ok(existing) => existing,
            Err(_) => group.create_group(segment)?,
        };
    }
    Ok((group, leaf))
}

fn read_group(
    group: &hdf5::Group,
    prefix: &str,
    out: &mut TrajectoryData,
) -> Result<(), CacheError> {
    for name in group.member_names()? {
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        if let Ok(nested) = group.group(&name) {
            read_group(&nested, &key, out)?;
        } else {
            let dataset = group.dataset(&name)?;
            out.insert(key, read_dataset(&dataset)?);
        }
    }
    Ok(())
}

fn read_dataset(dataset: &hdf5::Dataset) -> Result<FeatureArray, CacheError> {
    let descriptor = dataset.dtype()?.to_descriptor()?;
    Ok(match descriptor {
        TypeDescriptor::Unsigned(IntSize::U1) => FeatureArray::Uint8(dataset.read_dyn()?),
        TypeDescriptor::Integer(IntSize::U4) => FeatureArray::Int32(dataset.read_dyn()?),
        TypeDescriptor::Integer(IntSize::U8) => FeatureArray::Int64(dataset.read_dyn()?),
        TypeDescriptor::Float(FloatSize::U4) => FeatureArray::Float32(dataset.read_dyn()?),
        TypeDescriptor::Float(FloatSize::U8) => FeatureArray::Float64(dataset.read_dyn()?),
        TypeDescriptor::Boolean => FeatureArray::Bool(dataset.read_dyn()?),
        TypeDescriptor::VarLenUnicode => {
            let strings = dataset.read_dyn::<VarLenUnicode>()?;
            FeatureArray::Str(strings.mapv(|s| s.as_str().to_string()))
        }
        other => return Err(CacheError::UnsupportedDataset(format!("{other:?}"))),
    })
}
