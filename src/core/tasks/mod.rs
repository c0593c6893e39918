// src/core/tasks/mod.rs

//! This module contains all long-running background tasks that support the
//! agent's core functionality: disk usage accounting and token cache
//! maintenance.

pub mod disk_usage;
pub mod token_purger;
