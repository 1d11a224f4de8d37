pub mod repositories;

pub use repositories::{
    InMemoryPollStore, JsonFilePollStore, PollMap, PollStore, StoreError,
};
