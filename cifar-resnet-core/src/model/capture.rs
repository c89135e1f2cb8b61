use burn::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// Collects intermediate outputs of named layers during a forward pass.
///
/// Only the layers named at construction are kept; recorded tensors are detached from the
/// autodiff graph.
#[derive(Debug, Clone)]
pub struct ActivationCapture<B: Backend> {
    requested: BTreeSet<String>,
    captured: BTreeMap<String, Tensor<B, 4>>,
}

impl<B: Backend> ActivationCapture<B> {
    pub fn new<S: Into<String>>(layers: impl IntoIterator<Item = S>) -> Self {
        Self {
            requested: layers.into_iter().map(Into::into).collect(),
            captured: BTreeMap::new(),
        }
    }

    pub fn wants(&self, layer: &str) -> bool {
        self.requested.contains(layer)
    }

    pub(crate) fn record(&mut self, layer: &str, output: &Tensor<B, 4>) {
        if self.wants(layer) {
            self.captured
                .insert(layer.to_string(), output.clone().detach());
        }
    }

    pub fn take(&mut self, layer: &str) -> Option<Tensor<B, 4>> {
        self.captured.remove(layer)
    }
}
