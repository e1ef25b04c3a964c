pub mod helpers;
mod tests_driver;
mod tests_oracle;
mod tests_unit_runner;
