#![warn(missing_docs)]

//! # vla-codec-rs
//!
//! Trajectory container codec for robot-learning episodes. A trajectory is a
//! single Matroska file holding one stream per feature; large image-like
//! features are video-encoded (losslessly with FFV1, or lossily with AV1)
//! while everything else travels as pickled byte packets. All streams share a
//! millisecond time base so decoders can reconstruct the original step
//! sequence.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayD, Axis, Dimension, IxDyn};
use serde::{Deserialize, Serialize};

/// Stream encodings and per-feature codec selection
pub mod codec;

/// Error types for trajectory operations
pub mod error;

/// The HDF5-backed decoded cache
pub mod cache;

/// The trajectory container writer/reader
pub mod trajectory;

pub(crate) mod ffi;

pub use error::{CacheError, TrajectoryError};
pub use trajectory::{
    LoadResult, Mode, ReturnType, StreamInfo, Trajectory, TrajectoryData, TrajectoryOptions,
};

/// The shared stream time base: one tick is one millisecond of wall time
/// since the trajectory began.
pub const TIME_BASE: (i32, i32) = (1, 1000);

/// Canonical element type names, as stored in `FEATURE_TYPE` stream metadata.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dtype {
    Uint8,
    Int32,
    Int64,
    Float32,
    Float64,
    Bool,
    String,
}

impl Dtype {
    /// The stable lowercase name used in stream metadata and cache files.
    pub fn name(&self) -> &'static str {
        match self {
            Dtype::Uint8 => "uint8",
            Dtype::Int32 => "int32",
            Dtype::Int64 => "int64",
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
            Dtype::Bool => "bool",
            Dtype::String => "string",
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dtype {
    type Err = TrajectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uint8" => Ok(Dtype::Uint8),
            "int32" => Ok(Dtype::Int32),
            "int64" => Ok(Dtype::Int64),
            "float32" => Ok(Dtype::Float32),
            "float64" => Ok(Dtype::Float64),
            "bool" => Ok(Dtype::Bool),
            "string" => Ok(Dtype::String),
            other => Err(TrajectoryError::MalformedFeatureType(other.to_string())),
        }
    }
}

/// Canonical description of a feature's element: dtype and per-step shape.
///
/// Scalars (numbers, bools, strings) have the empty shape `()`. The textual
/// form `"<dtype>(<d0>,<d1>,…)"` is stable across library versions that share
/// container files; it round-trips through [`FromStr`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureType {
    dtype: Dtype,
    shape: Vec<usize>,
}

impl FeatureType {
    /// Create a feature type with the given dtype and shape.
    pub fn new(dtype: Dtype, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }

    /// Create a scalar feature type (empty shape).
    pub fn scalar(dtype: Dtype) -> Self {
        Self {
            dtype,
            shape: Vec::new(),
        }
    }

    /// Derive the feature type of a sample value.
    pub fn from_value(value: &Value) -> Self {
        value.feature_type()
    }

    /// The element dtype.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// The per-step shape. Empty for scalars.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total number of elements per step.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// `(width, height)` for image-like shapes `[H, W, …]`.
    pub(crate) fn video_dimensions(&self) -> Option<(u32, u32)> {
        if self.shape.len() >= 2 {
            Some((self.shape[1] as u32, self.shape[0] as u32))
        } else {
            None
        }
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.dtype)?;
        for (i, dim) in self.shape.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str(")")
    }
}

impl FromStr for FeatureType {
    type Err = TrajectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || TrajectoryError::MalformedFeatureType(s.to_string());
        let open = s.find('(').ok_or_else(malformed)?;
        if !s.ends_with(')') {
            return Err(malformed());
        }
        let dtype: Dtype = s[..open].parse()?;
        let inner = &s[open + 1..s.len() - 1];
        let mut shape = Vec::new();
        if !inner.is_empty() {
            for dim in inner.split(',') {
                shape.push(dim.trim().parse::<usize>().map_err(|_| malformed())?);
            }
        }
        Ok(Self { dtype, shape })
    }
}

/// One feature value at one step: a scalar, a string, or an n-d array.
///
/// This is the type that flows through the frame codec. `rawvideo` packet
/// bodies are the pickled serialization of this enum.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Uint8(u8),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    Str(String),
    ArrayUint8(ArrayD<u8>),
    ArrayInt32(ArrayD<i32>),
    ArrayInt64(ArrayD<i64>),
    ArrayFloat32(ArrayD<f32>),
    ArrayFloat64(ArrayD<f64>),
    ArrayBool(ArrayD<bool>),
}

impl Value {
    /// Derive the canonical [`FeatureType`] of this value.
    pub fn feature_type(&self) -> FeatureType {
        match self {
            Value::Uint8(_) => FeatureType::scalar(Dtype::Uint8),
            Value::Int32(_) => FeatureType::scalar(Dtype::Int32),
            Value::Int64(_) => FeatureType::scalar(Dtype::Int64),
            Value::Float32(_) => FeatureType::scalar(Dtype::Float32),
            Value::Float64(_) => FeatureType::scalar(Dtype::Float64),
            Value::Bool(_) => FeatureType::scalar(Dtype::Bool),
            Value::Str(_) => FeatureType::scalar(Dtype::String),
            Value::ArrayUint8(a) => FeatureType::new(Dtype::Uint8, a.shape().to_vec()),
            Value::ArrayInt32(a) => FeatureType::new(Dtype::Int32, a.shape().to_vec()),
            Value::ArrayInt64(a) => FeatureType::new(Dtype::Int64, a.shape().to_vec()),
            Value::ArrayFloat32(a) => FeatureType::new(Dtype::Float32, a.shape().to_vec()),
            Value::ArrayFloat64(a) => FeatureType::new(Dtype::Float64, a.shape().to_vec()),
            Value::ArrayBool(a) => FeatureType::new(Dtype::Bool, a.shape().to_vec()),
        }
    }
}

macro_rules! impl_scalar_value {
    ($t:ty, $variant:ident) => {
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v)
            }
        }

        impl From<$t> for Sample {
            fn from(v: $t) -> Self {
                Sample::Value(Value::$variant(v))
            }
        }
    };
}

impl_scalar_value!(u8, Uint8);
impl_scalar_value!(i32, Int32);
impl_scalar_value!(i64, Int64);
impl_scalar_value!(f32, Float32);
impl_scalar_value!(f64, Float64);
impl_scalar_value!(bool, Bool);
impl_scalar_value!(String, Str);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<&str> for Sample {
    fn from(v: &str) -> Self {
        Sample::Value(Value::from(v))
    }
}

macro_rules! impl_array_value {
    ($t:ty, $variant:ident) => {
        impl<D: Dimension> From<ndarray::Array<$t, D>> for Value {
            fn from(a: ndarray::Array<$t, D>) -> Self {
                Value::$variant(a.into_dyn())
            }
        }

        impl<D: Dimension> From<ndarray::Array<$t, D>> for Sample {
            fn from(a: ndarray::Array<$t, D>) -> Self {
                Sample::Value(Value::from(a))
            }
        }
    };
}

impl_array_value!(u8, ArrayUint8);
impl_array_value!(i32, ArrayInt32);
impl_array_value!(i64, ArrayInt64);
impl_array_value!(f32, ArrayFloat32);
impl_array_value!(f64, ArrayFloat64);
impl_array_value!(bool, ArrayBool);

impl From<Value> for Sample {
    fn from(v: Value) -> Self {
        Sample::Value(v)
    }
}

/// A step input for [`Trajectory::add_by_dict`]: either one value or a nested
/// map of further samples. Nested maps are flattened into `/`-separated
/// feature names (the separator is configurable).
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    /// A leaf value.
    Value(Value),
    /// A nested map of samples.
    Map(SampleMap),
}

/// One step's worth of named samples.
pub type SampleMap = BTreeMap<String, Sample>;

/// Column-major input for [`Trajectory::from_dict_of_lists`]: nested maps
/// whose leaves are per-step value sequences.
#[derive(Debug, Clone, PartialEq)]
pub enum Columns {
    /// A leaf sequence of per-step values.
    Values(Vec<Value>),
    /// A nested map of columns.
    Map(ColumnMap),
}

/// A named map of [`Columns`].
pub type ColumnMap = BTreeMap<String, Columns>;

impl<T: Into<Value>> From<Vec<T>> for Columns {
    fn from(values: Vec<T>) -> Self {
        Columns::Values(values.into_iter().map(Into::into).collect())
    }
}

/// Flatten a nested sample map into `(feature name, value)` pairs, joining
/// nesting levels with `separator`.
pub(crate) fn flatten_samples<'a>(map: &'a SampleMap, separator: &str) -> Vec<(String, &'a Value)> {
    fn walk<'a>(
        map: &'a SampleMap,
        prefix: Option<&str>,
        separator: &str,
        out: &mut Vec<(String, &'a Value)>,
    ) {
        for (key, sample) in map {
            let name = match prefix {
                Some(prefix) => format!("{prefix}{separator}{key}"),
                None => key.clone(),
            };
            match sample {
                Sample::Value(value) => out.push((name, value)),
                Sample::Map(nested) => walk(nested, Some(&name), separator, out),
            }
        }
    }
    let mut out = Vec::new();
    walk(map, None, separator, &mut out);
    out
}

/// Flatten a nested column map into `(feature name, sequence)` pairs.
pub(crate) fn flatten_columns<'a>(
    map: &'a ColumnMap,
    separator: &str,
) -> Vec<(String, &'a [Value])> {
    fn walk<'a>(
        map: &'a ColumnMap,
        prefix: Option<&str>,
        separator: &str,
        out: &mut Vec<(String, &'a [Value])>,
    ) {
        for (key, columns) in map {
            let name = match prefix {
                Some(prefix) => format!("{prefix}{separator}{key}"),
                None => key.clone(),
            };
            match columns {
                Columns::Values(values) => out.push((name, values)),
                Columns::Map(nested) => walk(nested, Some(&name), separator, out),
            }
        }
    }
    let mut out = Vec::new();
    walk(map, None, separator, &mut out);
    out
}

/// The decoded data of one feature: a dense `(N, *shape)` array covering
/// every step the feature was recorded at.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureArray {
    Uint8(ArrayD<u8>),
    Int32(ArrayD<i32>),
    Int64(ArrayD<i64>),
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
    Bool(ArrayD<bool>),
    Str(ArrayD<String>),
}

macro_rules! feature_array_accessor {
    ($name:ident, $t:ty, $variant:ident) => {
        /// Borrow the underlying array if this feature has the matching dtype.
        pub fn $name(&self) -> Option<&ArrayD<$t>> {
            match self {
                FeatureArray::$variant(a) => Some(a),
                _ => None,
            }
        }
    };
}

impl FeatureArray {
    /// Preallocate a zeroed dense array for `len` steps of `feature_type`.
    pub(crate) fn empty(feature_type: &FeatureType, len: usize) -> Self {
        let mut shape = Vec::with_capacity(feature_type.shape().len() + 1);
        shape.push(len);
        shape.extend_from_slice(feature_type.shape());
        let dim = IxDyn(&shape);
        match feature_type.dtype() {
            Dtype::Uint8 => FeatureArray::Uint8(ArrayD::default(dim)),
            Dtype::Int32 => FeatureArray::Int32(ArrayD::default(dim)),
            Dtype::Int64 => FeatureArray::Int64(ArrayD::default(dim)),
            Dtype::Float32 => FeatureArray::Float32(ArrayD::default(dim)),
            Dtype::Float64 => FeatureArray::Float64(ArrayD::default(dim)),
            Dtype::Bool => FeatureArray::Bool(ArrayD::default(dim)),
            Dtype::String => FeatureArray::Str(ArrayD::default(dim)),
        }
    }

    /// The full shape, including the leading step dimension.
    pub fn shape(&self) -> &[usize] {
        match self {
            FeatureArray::Uint8(a) => a.shape(),
            FeatureArray::Int32(a) => a.shape(),
            FeatureArray::Int64(a) => a.shape(),
            FeatureArray::Float32(a) => a.shape(),
            FeatureArray::Float64(a) => a.shape(),
            FeatureArray::Bool(a) => a.shape(),
            FeatureArray::Str(a) => a.shape(),
        }
    }

    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    /// Whether no steps were recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    feature_array_accessor!(as_uint8, u8, Uint8);
    feature_array_accessor!(as_int32, i32, Int32);
    feature_array_accessor!(as_int64, i64, Int64);
    feature_array_accessor!(as_float32, f32, Float32);
    feature_array_accessor!(as_float64, f64, Float64);
    feature_array_accessor!(as_bool, bool, Bool);
    feature_array_accessor!(as_str, String, Str);

    /// Write `value` into the step slot at `index`.
    ///
    /// Video-decoded grayscale (`uint8`) values are widened into `float32`
    /// slots without rescaling, matching the on-disk contract for
    /// float-typed video streams.
    pub(crate) fn assign_at(&mut self, index: usize, value: &Value) -> Result<(), TrajectoryError> {
        fn mismatch() -> TrajectoryError {
            TrajectoryError::Layout(ndarray::ShapeError::from_kind(
                ndarray::ErrorKind::IncompatibleShape,
            ))
        }

        fn assign_array<T: Clone>(
            target: &mut ArrayD<T>,
            index: usize,
            value: &ArrayD<T>,
        ) -> Result<(), TrajectoryError> {
            let mut slot = target.index_axis_mut(Axis(0), index);
            if slot.shape() != value.shape() {
                return Err(mismatch());
            }
            slot.assign(value);
            Ok(())
        }

        match (self, value) {
            (FeatureArray::Uint8(a), Value::Uint8(v)) => a.index_axis_mut(Axis(0), index).fill(*v),
            (FeatureArray::Int32(a), Value::Int32(v)) => a.index_axis_mut(Axis(0), index).fill(*v),
            (FeatureArray::Int64(a), Value::Int64(v)) => a.index_axis_mut(Axis(0), index).fill(*v),
            (FeatureArray::Float32(a), Value::Float32(v)) => {
                a.index_axis_mut(Axis(0), index).fill(*v)
            }
            (FeatureArray::Float64(a), Value::Float64(v)) => {
                a.index_axis_mut(Axis(0), index).fill(*v)
            }
            (FeatureArray::Bool(a), Value::Bool(v)) => a.index_axis_mut(Axis(0), index).fill(*v),
            (FeatureArray::Str(a), Value::Str(v)) => {
                a.index_axis_mut(Axis(0), index).fill(v.clone())
            }
            (FeatureArray::Uint8(a), Value::ArrayUint8(v)) => return assign_array(a, index, v),
            (FeatureArray::Int32(a), Value::ArrayInt32(v)) => return assign_array(a, index, v),
            (FeatureArray::Int64(a), Value::ArrayInt64(v)) => return assign_array(a, index, v),
            (FeatureArray::Float32(a), Value::ArrayFloat32(v)) => return assign_array(a, index, v),
            (FeatureArray::Float64(a), Value::ArrayFloat64(v)) => return assign_array(a, index, v),
            (FeatureArray::Bool(a), Value::ArrayBool(v)) => return assign_array(a, index, v),
            (FeatureArray::Float32(a), Value::ArrayUint8(v)) => {
                return assign_array(a, index, &v.mapv(f32::from))
            }
            _ => return Err(mismatch()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_feature_type_round_trip() {
        let cases = [
            FeatureType::new(Dtype::Uint8, vec![640, 480, 3]),
            FeatureType::new(Dtype::Float32, vec![4, 4]),
            FeatureType::scalar(Dtype::Float64),
            FeatureType::scalar(Dtype::String),
            FeatureType::new(Dtype::Bool, vec![0]),
        ];
        for feature_type in cases {
            let text = feature_type.to_string();
            let parsed: FeatureType = text.parse().unwrap();
            assert_eq!(parsed, feature_type, "round-tripping `{text}`");
        }
        assert_eq!(
            FeatureType::new(Dtype::Uint8, vec![640, 480, 3]).to_string(),
            "uint8(640,480,3)"
        );
        assert_eq!(FeatureType::scalar(Dtype::Float64).to_string(), "float64()");
    }

    #[test]
    fn test_feature_type_malformed() {
        assert!("uint8".parse::<FeatureType>().is_err());
        assert!("uint8(1,2".parse::<FeatureType>().is_err());
        assert!("complex128()".parse::<FeatureType>().is_err());
        assert!("uint8(a,b)".parse::<FeatureType>().is_err());
    }

    #[test]
    fn test_feature_type_from_value() {
        let value = Value::from(Array2::<f32>::ones((4, 4)));
        assert_eq!(
            value.feature_type(),
            FeatureType::new(Dtype::Float32, vec![4, 4])
        );
        assert_eq!(
            Value::from(1.5f64).feature_type(),
            FeatureType::scalar(Dtype::Float64)
        );
        assert_eq!(
            Value::from("gripper open").feature_type(),
            FeatureType::scalar(Dtype::String)
        );
    }

    #[test]
    fn test_flatten_samples() {
        let mut pose = SampleMap::new();
        pose.insert("pos".to_string(), Sample::from(1.0f64));
        pose.insert("rot".to_string(), Sample::from(2.0f64));
        let mut step = SampleMap::new();
        step.insert("pose".to_string(), Sample::Map(pose));
        step.insert("gripper".to_string(), Sample::from(0.5f64));

        let flat = flatten_samples(&step, "/");
        let names: Vec<&str> = flat.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["gripper", "pose/pos", "pose/rot"]);

        let flat = flatten_samples(&step, "_");
        let names: Vec<&str> = flat.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["gripper", "pose_pos", "pose_rot"]);
    }

    #[test]
    fn test_assign_at_casts_gray_into_float_slots() {
        let feature_type = FeatureType::new(Dtype::Float32, vec![2, 2]);
        let mut array = FeatureArray::empty(&feature_type, 1);
        let gray = Value::from(Array2::<u8>::from_elem((2, 2), 255));
        array.assign_at(0, &gray).unwrap();
        let decoded = array.as_float32().unwrap();
        assert!(decoded.iter().all(|&v| v == 255.0));
    }

    #[test]
    fn test_assign_at_rejects_wrong_shape() {
        let feature_type = FeatureType::new(Dtype::Uint8, vec![2, 2]);
        let mut array = FeatureArray::empty(&feature_type, 1);
        let wrong = Value::from(Array2::<u8>::zeros((3, 3)));
        assert!(array.assign_at(0, &wrong).is_err());
    }
}
