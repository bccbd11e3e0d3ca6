pub mod doctor;
pub mod gui;
pub mod live;
pub mod run;
pub mod status;
pub mod web;
