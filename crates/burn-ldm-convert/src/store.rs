//! In-memory tensor store addressed by dotted parameter names
//!
//! Checkpoint readers fill a [`TensorStore`] with `name -> TensorData`
//! entries; loaders walk it through [`VarPath`] scopes such as
//! `down_blocks.0.resnets.1`.

use std::collections::HashMap;
use std::fmt;

use burn::prelude::*;
use thiserror::Error;

use burn_ldm_core::LdmError;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Model error: {0}")]
    Model(#[from] LdmError),
}

/// Named tensors held in host memory
#[derive(Debug, Clone, Default)]
pub struct TensorStore {
    tensors: HashMap<String, TensorData>,
}

impl TensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a tensor
    pub fn insert(&mut self, name: impl Into<String>, data: TensorData) {
        self.tensors.insert(name.into(), data);
    }

    /// Add or replace a tensor taken from a backend tensor
    pub fn insert_tensor<B: Backend, const D: usize>(
        &mut self,
        name: impl Into<String>,
        tensor: Tensor<B, D>,
    ) {
        self.insert(name, tensor.into_data());
    }

    /// Check if a tensor exists
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&TensorData> {
        self.tensors.get(name)
    }

    /// Get tensor shape
    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    /// List all tensor names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Scope at the top of the name hierarchy
    pub fn root(&self) -> VarPath<'_> {
        VarPath {
            store: self,
            prefix: String::new(),
        }
    }

    /// Scope under `prefix`, e.g. `"vae"` or `"first_stage_model"`
    pub fn path(&self, prefix: &str) -> VarPath<'_> {
        self.root().push(prefix)
    }
}

/// A dotted scope into a [`TensorStore`]
#[derive(Debug, Clone)]
pub struct VarPath<'a> {
    store: &'a TensorStore,
    prefix: String,
}

impl<'a> VarPath<'a> {
    /// Child scope `prefix.name`
    pub fn push(&self, name: &str) -> VarPath<'a> {
        VarPath {
            store: self.store,
            prefix: self.key(name),
        }
    }

    /// Child scope `prefix.index`, for entries of a module list
    pub fn push_index(&self, index: usize) -> VarPath<'a> {
        self.push(&index.to_string())
    }

    /// Full name of `name` inside this scope
    pub fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.store.contains(&self.key(name))
    }

    /// Load `name` as a float tensor, checking it has exactly `shape`
    pub fn get<B: Backend, const D: usize>(
        &self,
        name: &str,
        shape: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let key = self.key(name);
        let data = self
            .store
            .get(&key)
            .ok_or_else(|| LoadError::TensorNotFound(key.clone()))?;

        if data.shape.as_slice() != shape.as_slice() {
            return Err(LoadError::ShapeMismatch {
                name: key,
                expected: shape.to_vec(),
                actual: data.shape.clone(),
            });
        }

        log::trace!("{key}: {shape:?}");
        Ok(Tensor::from_data(
            data.clone().convert::<B::FloatElem>(),
            device,
        ))
    }
}

impl fmt::Display for VarPath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "<root>")
        } else {
            f.write_str(&self.prefix)
        }
    }
}
