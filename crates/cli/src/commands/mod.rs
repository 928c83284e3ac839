pub mod evaluate;
pub mod event;
pub mod inspect;
