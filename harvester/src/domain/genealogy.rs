//! Dataset genealogy as an arena.
//!
//! Nodes live in a `Vec` and refer to each other by index. The parent→children
//! index is built once from the `(key, parent_key)` links of a subtree, so
//! traversals never chase references between dataset values.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::database::models::DatasetLinkDbModel;
use crate::utils::json::{self, JsonContext};
use crate::{Error, Result};

/// One dataset in a subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct GenealogyNode {
    pub key: String,
    pub parent_key: Option<String>,
    pub is_finished: bool,
    pub result_file: Option<String>,
    /// Key of the dataset this node copies its result into, if any.
    pub attach_to: Option<String>,
}

/// A rooted subtree of datasets.
#[derive(Debug, Clone)]
pub struct Genealogy {
    nodes: Vec<GenealogyNode>,
    index: HashMap<String, usize>,
    children: Vec<Vec<usize>>,
    root: usize,
}

impl Genealogy {
    /// Build the arena rooted at `root_key` from the links of its subtree.
    ///
    /// Links whose parent is not part of the set are ignored, as is any link
    /// pointing back at the root, so the result is always a tree.
    pub fn build(root_key: &str, links: Vec<DatasetLinkDbModel>) -> Result<Self> {
        let mut nodes = Vec::with_capacity(links.len());
        let mut index = HashMap::with_capacity(links.len());

        for link in links {
            if index.contains_key(&link.key) {
                continue;
            }
            let parameters: Map<String, Value> = json::parse_or_default(
                &link.parameters,
                JsonContext::DatasetField {
                    dataset_key: &link.key,
                    field: "parameters",
                },
                "Failed to parse dataset parameters",
            );
            let attach_to = parameters
                .get("attach_to")
                .and_then(Value::as_str)
                .map(str::to_string);

            index.insert(link.key.clone(), nodes.len());
            nodes.push(GenealogyNode {
                key: link.key,
                parent_key: link.parent_key,
                is_finished: link.is_finished,
                result_file: link.result_file,
                attach_to,
            });
        }

        let root = *index
            .get(root_key)
            .ok_or_else(|| Error::dataset_not_found(root_key))?;

        let mut children = vec![Vec::new(); nodes.len()];
        for (idx, node) in nodes.iter().enumerate() {
            if idx == root {
                continue;
            }
            if let Some(parent_idx) = node.parent_key.as_ref().and_then(|p| index.get(p)) {
                children[*parent_idx].push(idx);
            }
        }

        Ok(Self {
            nodes,
            index,
            children,
            root,
        })
    }

    pub fn root(&self) -> &GenealogyNode {
        &self.nodes[self.root]
    }

    pub fn get(&self, key: &str) -> Option<&GenealogyNode> {
        self.index.get(key).map(|&idx| &self.nodes[idx])
    }

    pub fn children(&self, key: &str) -> Vec<&GenealogyNode> {
        self.index
            .get(key)
            .map(|&idx| self.children[idx].iter().map(|&c| &self.nodes[c]).collect())
            .unwrap_or_default()
    }

    /// Every node reachable from the root, excluding the root, in pre-order.
    pub fn descendants(&self) -> Vec<&GenealogyNode> {
        let mut out = Vec::new();
        let mut stack: Vec<usize> = self.children[self.root].iter().rev().copied().collect();
        while let Some(idx) = stack.pop() {
            out.push(&self.nodes[idx]);
            stack.extend(self.children[idx].iter().rev().copied());
        }
        out
    }

    /// Keys of the whole tree, depth-first with every child before its parent.
    pub fn deletion_order(&self) -> Vec<String> {
        let mut order = Vec::with_capacity(self.nodes.len());
        // (node, children already pushed)
        let mut stack = vec![(self.root, false)];
        while let Some((idx, expanded)) = stack.pop() {
            if expanded {
                order.push(self.nodes[idx].key.clone());
            } else {
                stack.push((idx, true));
                for &child in self.children[idx].iter().rev() {
                    stack.push((child, false));
                }
            }
        }
        order
    }

    pub fn has_unfinished_descendants(&self) -> bool {
        self.descendants().iter().any(|node| !node.is_finished)
    }

    /// Whether a pipeline below the root attaches its result to the root.
    pub fn is_sink(&self) -> bool {
        let root_key = &self.root().key;
        self.descendants()
            .iter()
            .any(|node| node.attach_to.as_deref() == Some(root_key.as_str()))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GenealogyNode> {
        self.nodes.iter()
    }
}
