pub mod error;
pub use error::{Result, RsisError};

pub mod scheduler;
pub use scheduler::{NrtScheduler, RunReport, Scheduler, StopReason, Time, TimeManager};

pub mod thread;
pub use thread::{Callback, ThreadHandler};

pub mod library;
pub use library::{LibraryHandle, LibraryManager};

pub mod model;
pub use model::ModelInstance;

pub mod registration;
pub use registration::{FieldInfo, ModelReflection, ModelRegistration};

pub mod channel;
pub use channel::ChannelRegistry;

pub mod connection;
pub use connection::Connection;

pub mod framework;
pub use framework::{Framework, FrameworkConfig, FrameworkState};

pub mod config;
pub use config::Config;

pub mod scenario;

pub mod ffi;

// Re-export the plugin ABI for hosts
pub use rsis_model_abi;
pub use rsis_model_abi::{
    ChannelStatus, CmdStatus, ConfigStatus, MsgStatus, PluginEntryPoints, RuntimeStatus,
};
