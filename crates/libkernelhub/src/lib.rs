pub mod broker;
pub mod echo;
pub mod error;
pub mod kernel;
pub mod registry;
pub mod session;

pub use broker::{
    ChannelHandle, ConnectOptions, KernelBroker, KernelBrokerConfig, KernelChange, StartOptions,
};
pub use echo::{ECHO_KERNEL_NAME, EchoKernel};
pub use error::HubError;
pub use kernel::{DisposeBell, Kernel, KernelFactory, KernelStartArgs, SendMessage};
pub use registry::KernelRegistry;
pub use session::{RESTART_GRACE, SessionBroker, SessionPatchOptions, SessionStartOptions};
