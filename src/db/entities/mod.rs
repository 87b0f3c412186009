//! SeaORM entities for the fleet ledger.
//!
//! One module per table; the prelude re-exports entity/model/column types
//! for convenient importing.

pub mod account;
pub mod server;
pub mod traffic_sample;

pub mod prelude {
    pub use super::server::ActiveModel as ServerActiveModel;
    pub use super::server::Column as ServerColumn;
    pub use super::server::Entity as Server;
    pub use super::server::Model as ServerModel;

    pub use super::account::ActiveModel as AccountActiveModel;
    pub use super::account::Column as AccountColumn;
    pub use super::account::Entity as Account;
    pub use super::account::Model as AccountModel;

    pub use super::traffic_sample::ActiveModel as TrafficSampleActiveModel;
    pub use super::traffic_sample::Column as TrafficSampleColumn;
    pub use super::traffic_sample::Entity as TrafficSample;
    pub use super::traffic_sample::Model as TrafficSampleModel;
}
