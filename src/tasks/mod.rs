pub mod evaluate;
pub mod gac_updater;
