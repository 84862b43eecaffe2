pub mod autograd;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod training;
