//! TinyG and g2core support
//!
//! Both firmwares speak JSON once `{ej:1}` is sent. Every command gets a
//! response object `{"r":{...},"f":[rev,status,rx]}` and the firmware pushes
//! `{"sr":{...}}` status reports on its own at the interval set with
//! `{si:ms}`, so no poll timer is needed.

pub mod controller;
pub mod report;

pub use controller::TinyGDialect;
pub use report::{parse_report, TinyGReport};
