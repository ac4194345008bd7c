pub mod boundary;
pub mod command;
pub mod config;
pub mod event;
pub mod host;
pub mod loader;
pub mod module;
pub mod node;
pub mod orchestrator;
pub mod registry;
pub mod role;
pub mod sandbox;
pub mod scanner;
pub mod stats;
pub mod store;
pub mod watch;
pub mod window;

mod sync;

pub use boundary::{CrashBoundary, RenderCrash};
pub use command::{CommandBridge, CommandError, CommandExecutor, CommandState, ShellExecutor};
pub use config::{ConfigError, RuntimeConfig};
pub use event::{BundleChanged, Event, EventBus, EventPayload, WIDGETS_RELOAD, WIDGETS_UPDATE};
pub use host::{ControlSurface, HostError, Runtime, WidgetHost, WindowContent};
pub use loader::{FsReader, LoadError, LoadMode, ModuleLoader, SourceReader};
pub use module::{RenderError, RenderProps, WidgetModule};
pub use node::Node;
pub use orchestrator::{OrchestratorTiming, WindowFields, WindowOrchestrator};
pub use registry::{
    InstanceId, InstancePatch, InstanceRegistry, InstanceState, RegistryError, RegistrySnapshot,
    RegistryView, WidgetInstance,
};
pub use role::{ProcessRole, RoleError};
pub use sandbox::{Sandbox, SandboxError};
pub use scanner::{BundleScanner, ScanError, ScanReport, WidgetTypeDescriptor};
pub use stats::{AppStats, ProcessUsage, StatsSampler};
pub use store::{FileStore, MemoryStore, Store, StoreError};
pub use watch::{BundleWatcher, WatchError};
pub use window::{
    Effect, Geometry, MemoryWindow, MemoryWindows, WidgetWindow, WindowLevel, WindowOpError,
    WindowService,
};
