use crate::error::TreeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

const SEGMENT_SEPARATOR: char = '/';

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WidgetAddress(Vec<String>);

impl WidgetAddress {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn parent(&self) -> Option<Self> {
        let (_, parent) = self.0.split_last()?;
        Some(Self(parent.to_vec()))
    }

    pub fn child_id(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn is_descendant_of(&self, ancestor: &Self) -> bool {
        self.0.len() > ancestor.0.len() && self.0.starts_with(&ancestor.0)
    }
}

impl fmt::Display for WidgetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }

        for segment in &self.0 {
            write!(f, "{SEGMENT_SEPARATOR}{segment}")?;
        }

        Ok(())
    }
}

pub fn resolve_child(parent: &WidgetAddress, child_id: &str) -> WidgetAddress {
    let mut segments = Vec::with_capacity(parent.0.len() + 1);
    segments.extend_from_slice(&parent.0);
    segments.push(child_id.to_string());
    WidgetAddress(segments)
}

pub fn validate_child_id(child_id: &str) -> Result<(), TreeError> {
    if child_id.is_empty() || child_id.contains(SEGMENT_SEPARATOR) {
        return Err(TreeError::InvalidChildId {
            child_id: child_id.to_string(),
        });
    }

    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct ChildIds {
    claimed: BTreeSet<String>,
}

impl ChildIds {
    pub fn claim(
        &mut self,
        parent: &WidgetAddress,
        child_id: &str,
    ) -> Result<WidgetAddress, TreeError> {
        validate_child_id(child_id)?;

        if !self.claimed.insert(child_id.to_string()) {
            return Err(TreeError::DuplicateChildId {
                parent: parent.clone(),
                child_id: child_id.to_string(),
            });
        }

        Ok(resolve_child(parent, child_id))
    }

    pub fn release(&mut self, child_id: &str) -> bool {
        self.claimed.remove(child_id)
    }

    pub fn contains(&self, child_id: &str) -> bool {
        self.claimed.contains(child_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.claimed.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }
}
