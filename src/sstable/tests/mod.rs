mod tests_basic;
mod tests_find;
mod tests_run;
