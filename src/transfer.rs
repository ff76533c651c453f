use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
  Active,
  Completed,
  Error,
}

/// One file in flight, from either side of the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
  pub name: String,
  pub size: u64,
  pub moved: u64,
  pub status: TransferStatus,
}

impl TransferRecord {
  pub fn new(name: impl Into<String>, size: u64) -> Self {
    Self {
      name: name.into(),
      size,
      moved: 0,
      status: TransferStatus::Active,
    }
  }
}

/// Reduces a peer-supplied name to a bare file name. Empty input gets a generated name.
pub fn sanitize_file_name(name: &str) -> String {
  let candidate = Path::new(name.trim())
    .file_name()
    .and_then(|n| n.to_str())
    .unwrap_or("");
  let trimmed = candidate.trim();
  if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
    default_file_name()
  } else {
    trimmed.to_string()
  }
}

pub fn default_file_name() -> String {
  format!("file_{}.bin", chrono::Utc::now().timestamp_millis())
}
