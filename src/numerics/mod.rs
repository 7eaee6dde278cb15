pub mod comm;
pub mod matrix;
pub mod row_surgery;
pub mod solver;
pub mod transient;
