pub mod epoll;
pub mod eventfd;
pub mod fd;
pub mod poll;
pub mod socket;

pub use epoll::{Event, Events, Selector};
