//! Load state of data the controller exposes to the UI.
//!
//! Modelled as a small state machine: `Empty -> Loading -> Loaded | Error`.
//! A failed load keeps whatever data was already held, so an error is
//! always shown next to the last good data rather than replacing it.

use chrono::{DateTime, Utc};

use crate::api::ErrorKind;

/// The state of one logical resource (a list or a single record).
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  /// Nothing loaded yet
  Empty,
  /// A load is running; previously held data stays visible
  Loading(Option<T>),
  /// Data is present
  Loaded {
    data: T,
    /// When the data was last confirmed by the backend
    synced_at: Option<DateTime<Utc>>,
    /// Served from cache after the backend could not be reached
    stale: bool,
  },
  /// The last load failed
  Error {
    kind: ErrorKind,
    message: String,
    stale: Option<T>,
  },
}

impl<T> Default for QueryState<T> {
  fn default() -> Self {
    QueryState::Empty
  }
}

impl<T> QueryState<T> {
  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Empty => None,
      QueryState::Loading(data) => data.as_ref(),
      QueryState::Loaded { data, .. } => Some(data),
      QueryState::Error { stale, .. } => stale.as_ref(),
    }
  }

  pub fn data_mut(&mut self) -> Option<&mut T> {
    match self {
      QueryState::Empty => None,
      QueryState::Loading(data) => data.as_mut(),
      QueryState::Loaded { data, .. } => Some(data),
      QueryState::Error { stale, .. } => stale.as_mut(),
    }
  }

  pub fn error(&self) -> Option<(ErrorKind, &str)> {
    match self {
      QueryState::Error { kind, message, .. } => Some((*kind, message)),
      _ => None,
    }
  }

  /// Error state that still carries earlier data.
  pub fn has_stale_data(&self) -> bool {
    matches!(self, QueryState::Error { stale: Some(_), .. })
  }

  /// Loaded from cache because the backend could not be reached.
  pub fn is_stale(&self) -> bool {
    matches!(self, QueryState::Loaded { stale: true, .. })
  }

  pub fn synced_at(&self) -> Option<DateTime<Utc>> {
    match self {
      QueryState::Loaded { synced_at, .. } => *synced_at,
      _ => None,
    }
  }

  fn take_data(&mut self) -> Option<T> {
    match std::mem::replace(self, QueryState::Empty) {
      QueryState::Empty => None,
      QueryState::Loading(data) => data,
      QueryState::Loaded { data, .. } => Some(data),
      QueryState::Error { stale, .. } => stale,
    }
  }

  pub fn start_loading(&mut self) {
    let data = self.take_data();
    *self = QueryState::Loading(data);
  }

  pub fn succeed(&mut self, data: T, synced_at: Option<DateTime<Utc>>, stale: bool) {
    *self = QueryState::Loaded {
      data,
      synced_at,
      stale,
    };
  }

  pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) {
    let stale = self.take_data();
    *self = QueryState::Error {
      kind,
      message: message.into(),
      stale,
    };
  }
}

impl<T: Default> QueryState<T> {
  /// Mutable data, materializing an empty value when nothing is held yet.
  pub fn data_or_default(&mut self) -> &mut T {
    match self {
      QueryState::Loading(data) => data.get_or_insert_with(T::default),
      QueryState::Error { stale, .. } => stale.get_or_insert_with(T::default),
      QueryState::Loaded { data, .. } => data,
      QueryState::Empty => {
        *self = QueryState::Loaded {
          data: T::default(),
          synced_at: None,
          stale: false,
        };
        self.data_or_default()
      }
    }
  }
}
