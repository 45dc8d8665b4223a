use crate::bridge::BridgePhase;
use crate::descriptor::{ConfigDescriptor, Ownership};
use crate::error::{StateError, SyncFailure};
use crate::protocol::PatchOp;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UiState {
    values: Map<String, Value>,
}

impl UiState {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn set(
        &mut self,
        descriptor: &ConfigDescriptor,
        field: &str,
        value: Value,
    ) -> Result<Option<Value>, StateError> {
        check_ui_owned(descriptor, field)?;
        Ok(self.values.insert(field.to_string(), value))
    }

    pub fn remove(
        &mut self,
        descriptor: &ConfigDescriptor,
        field: &str,
    ) -> Result<Option<Value>, StateError> {
        check_ui_owned(descriptor, field)?;
        Ok(self.values.remove(field))
    }
}

fn check_ui_owned(descriptor: &ConfigDescriptor, field: &str) -> Result<(), StateError> {
    match descriptor.ownership(field) {
        Some(Ownership::UiOwned) => Ok(()),
        Some(Ownership::BackendOwned) => Err(StateError::BackendOwned(field.to_string())),
        None => Err(StateError::UndeclaredField(field.to_string())),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub applied: Vec<String>,
    pub dropped: Vec<String>,
    pub rejected: Vec<String>,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        !self.applied.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendState {
    values: Map<String, Value>,
}

impl BackendState {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Merge-patch: `null` removes a field, objects merge recursively and any
    /// other value overwrites.
    pub(crate) fn merge(
        &mut self,
        descriptor: &ConfigDescriptor,
        fields: Map<String, Value>,
    ) -> MergeReport {
        let mut report = MergeReport::default();

        for (field, value) in fields {
            if !descriptor.is_backend_owned(&field) {
                report.dropped.push(field);
                continue;
            }

            if value.is_null() {
                self.values.remove(&field);
            } else {
                merge_patch(self.values.entry(field.clone()).or_insert(Value::Null), value);
            }
            report.applied.push(field);
        }

        report
    }

    pub(crate) fn replace(
        &mut self,
        descriptor: &ConfigDescriptor,
        fields: Map<String, Value>,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        let previous = std::mem::take(&mut self.values);

        for (field, value) in fields {
            if !descriptor.is_backend_owned(&field) {
                report.dropped.push(field);
                continue;
            }

            if !value.is_null() {
                self.values.insert(field.clone(), value);
            }
            report.applied.push(field);
        }

        for field in previous.keys() {
            if !self.values.contains_key(field) && !report.applied.contains(field) {
                report.applied.push(field.clone());
            }
        }

        report
    }

    pub(crate) fn apply_ops(
        &mut self,
        descriptor: &ConfigDescriptor,
        ops: &[PatchOp],
    ) -> MergeReport {
        let mut report = MergeReport::default();

        for op in ops {
            let path = op.path();
            let tokens = match parse_pointer(path) {
                Ok(tokens) if !tokens.is_empty() => tokens,
                Ok(_) => {
                    report.rejected.push(format!("{path}: whole-state ops are not allowed"));
                    continue;
                }
                Err(err) => {
                    report.rejected.push(err);
                    continue;
                }
            };

            let field = tokens[0].clone();
            if !descriptor.is_backend_owned(&field) {
                report.dropped.push(field);
                continue;
            }

            let mut root = Value::Object(std::mem::take(&mut self.values));
            let result = match op {
                PatchOp::Replace { value, .. } => {
                    set_path(&mut root, &tokens, path, value.clone(), true)
                }
                PatchOp::Add { value, .. } => {
                    set_path(&mut root, &tokens, path, value.clone(), false)
                }
                PatchOp::Remove { .. } => remove_path(&mut root, &tokens, path),
            };
            if let Value::Object(values) = root {
                self.values = values;
            }

            match result {
                Ok(()) => {
                    if !report.applied.contains(&field) {
                        report.applied.push(field);
                    }
                }
                Err(err) => report.rejected.push(err),
            }
        }

        report
    }

    pub(crate) fn clear(&mut self) {
        self.values.clear();
    }
}

fn merge_patch(target: &mut Value, patch: Value) {
    let patch = match patch {
        Value::Object(patch) => patch,
        other => {
            *target = other;
            return;
        }
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }

    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(&key);
            } else {
                merge_patch(target.entry(key).or_insert(Value::Null), value);
            }
        }
    }
}

fn set_path(
    root: &mut Value,
    tokens: &[String],
    path: &str,
    value: Value,
    replace_only: bool,
) -> Result<(), String> {
    let Some((last, parents)) = tokens.split_last() else {
        *root = value;
        return Ok(());
    };

    let mut current = root;

    for token in parents {
        current = descend_or_create(current, token)?;
    }

    match current {
        Value::Object(map) => {
            if replace_only && !map.contains_key(last) {
                return Err(format!("replace path does not exist: {path}"));
            }

            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = parse_index(last, items.len(), path)?;

            if index == items.len() {
                if replace_only {
                    return Err(format!("replace path does not exist: {path}"));
                }
                items.push(value);
            } else if replace_only {
                items[index] = value;
            } else {
                items.insert(index, value);
            }

            Ok(())
        }
        _ => Err(format!("cannot set path on non-container parent: {path}")),
    }
}

fn remove_path(root: &mut Value, tokens: &[String], path: &str) -> Result<(), String> {
    let Some((last, parents)) = tokens.split_last() else {
        *root = Value::Object(Map::new());
        return Ok(());
    };

    let mut current = root;

    for token in parents {
        current = descend_existing(current, token)
            .ok_or_else(|| format!("remove path does not exist: {path}"))?;
    }

    match current {
        Value::Object(map) => {
            if map.remove(last).is_some() {
                Ok(())
            } else {
                Err(format!("remove path does not exist: {path}"))
            }
        }
        Value::Array(items) => {
            let index = parse_index(last, items.len().saturating_sub(1), path)?;

            if index < items.len() {
                items.remove(index);
                Ok(())
            } else {
                Err(format!("remove path index out of bounds: {path}"))
            }
        }
        _ => Err(format!("cannot remove path on non-container parent: {path}")),
    }
}

fn parse_pointer(path: &str) -> Result<Vec<String>, String> {
    if path.is_empty() {
        return Ok(vec![]);
    }

    if !path.starts_with('/') {
        return Err(format!("invalid json pointer path: {path}"));
    }

    path.split('/')
        .skip(1)
        .map(unescape_json_pointer_token)
        .collect()
}

fn unescape_json_pointer_token(token: &str) -> Result<String, String> {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();

    while let Some(ch) = chars.next() {
        if ch == '~' {
            match chars.next() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                Some(other) => {
                    return Err(format!("invalid escape ~{other} in json pointer token"));
                }
                None => return Err("trailing ~ in json pointer token".to_string()),
            }
        } else {
            out.push(ch);
        }
    }

    Ok(out)
}

fn descend_or_create<'a>(value: &'a mut Value, token: &str) -> Result<&'a mut Value, String> {
    match value {
        Value::Object(map) => Ok(map
            .entry(token.to_string())
            .or_insert_with(|| Value::Object(Map::new()))),
        Value::Array(items) => {
            let index = parse_index(token, items.len(), token)?;
            items
                .get_mut(index)
                .ok_or_else(|| format!("array index out of bounds at token {token}"))
        }
        _ => Err(format!(
            "cannot descend into non-container value at token {token}"
        )),
    }
}

fn descend_existing<'a>(value: &'a mut Value, token: &str) -> Option<&'a mut Value> {
    match value {
        Value::Object(map) => map.get_mut(token),
        Value::Array(items) => token
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get_mut(index)),
        _ => None,
    }
}

fn parse_index(token: &str, max_len: usize, path: &str) -> Result<usize, String> {
    let index = token
        .parse::<usize>()
        .map_err(|_| format!("invalid array index '{token}' at path {path}"))?;

    if index > max_len {
        Err(format!("array index out of bounds '{token}' at path {path}"))
    } else {
        Ok(index)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub phase: BridgePhase,
    pub failure: Option<SyncFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct WidgetState {
    ui: UiState,
    backend: BackendState,
    sync: SyncStatus,
}

impl WidgetState {
    pub fn ui(&self) -> &UiState {
        &self.ui
    }

    pub fn ui_mut(&mut self) -> &mut UiState {
        &mut self.ui
    }

    pub fn backend(&self) -> &BackendState {
        &self.backend
    }

    pub(crate) fn backend_mut(&mut self) -> &mut BackendState {
        &mut self.backend
    }

    pub fn sync(&self) -> &SyncStatus {
        &self.sync
    }

    pub(crate) fn sync_mut(&mut self) -> &mut SyncStatus {
        &mut self.sync
    }

    pub fn merged(&self) -> Map<String, Value> {
        let mut merged = self.ui.values.clone();
        merged.extend(
            self.backend
                .values
                .iter()
                .map(|(field, value)| (field.clone(), value.clone())),
        );
        merged
    }
}
