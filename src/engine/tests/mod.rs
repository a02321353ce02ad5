mod helpers;

mod tests_batch;
mod tests_close;
mod tests_iterator;
