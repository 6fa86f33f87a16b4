pub mod buddy_groups;
pub mod entry_map;
pub mod error;
pub mod messenger;
pub mod node;
pub mod notify;
pub mod registry;
pub mod routes;
pub mod shutdown;
pub mod state;
pub mod state_file;
pub mod sweeper;
pub mod syncer;
pub mod target_mapper;
pub mod target_states;
