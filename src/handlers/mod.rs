pub mod factory;
pub mod users;

pub use factory::{
    create_one, delete_one, get_all, get_all_agg, get_one, singular_create_and_update, update_one, Populate,
};
