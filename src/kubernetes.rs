pub(crate) mod access;
mod base;
mod exec;
mod job;
mod labels;
mod service;
mod template;
mod watch;

pub use job::JobRuntime;
pub use service::ServiceRuntime;

pub use labels::{INSTANCE_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
