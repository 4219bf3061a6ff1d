#![allow(unused_imports)]

pub use crate::error::{Error, Result};
pub use std::collections::{BTreeMap, HashMap, HashSet};
pub use std::sync::{Arc, LazyLock, Mutex, OnceLock, RwLock};

pub use indexmap::{IndexMap, IndexSet};
pub use itertools::Itertools;
pub use serde::{Deserialize, Serialize};
pub use tracing::{debug, error, info, trace, warn};

pub use async_trait::async_trait;
