pub mod config;
pub mod error;
pub mod relay;

pub use error::{RelayError, Result};
pub use relay::{
    serve, start, Accept, Bridge, BridgeOutcome, ClassifiedError, Classifier, Connection,
    ConnectionSummary, CopyOutcome, Destination, Direction, ErrorClass, Listener, ListenerConfig,
    ListenerSpec, ListenerStats, Matcher, MemoryObserver, NoopObserver, Observer, RelayEvent,
    SharedObserver, Signature, TracingObserver,
};
