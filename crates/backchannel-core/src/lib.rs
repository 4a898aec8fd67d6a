pub mod ids;
pub mod roles;
pub mod timefmt;
pub mod users;

pub use roles::Role;
pub use users::User;
