//! Safe-mode sandbox: image construction, the privilege boundary and the
//! environment contract the agent runs under.

pub mod container;
pub mod contract;
pub mod dockerfile;
pub mod guard;
pub mod identity;
pub mod layout;
pub mod mounts;
pub mod pipeline;

pub use container::build_image;
pub use contract::{EnvContract, EnvVar};
pub use pipeline::{ImagePlan, ImageState};
