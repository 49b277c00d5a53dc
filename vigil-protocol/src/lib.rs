//! Wire-level types shared by every Vigil crate: entities, their typed
//! property bags and the payloads exchanged over the message bus.

pub mod entity;
pub mod message;
pub mod properties;

pub use entity::{EntityInstance, EntityType, EntityWithProperties};
pub use message::{
    EntityInfoWrapper, EntityRefreshRequest, Message, ProtocolError, EXECUTION_ID_KEY,
    TOPIC_ADD_ORIGINATING, TOPIC_DELETE_ORIGINATING, TOPIC_ENTITY_EVALUATE, TOPIC_ENTITY_FLUSH,
    TOPIC_REFRESH_AND_EVALUATE,
};
pub use properties::{Properties, Property, PropertyError, PropertyValue};
