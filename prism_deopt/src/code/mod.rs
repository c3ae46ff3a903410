//! Compiled code as seen by the deoptimization engine.

pub mod cache;
pub mod debug_info;
pub mod region;

pub use cache::{CodeCache, CodeCacheStats};
pub use debug_info::{
    DebugInfo, Location, LocationKind, LocationType, MonitorValue, ObjectDescriptor, ObjectId,
    PcDesc, ScopeDesc, ScopeValue,
};
pub use region::{CompiledRegion, DeoptStatus, EntryState};
