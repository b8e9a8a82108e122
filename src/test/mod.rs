mod support;

mod continuing_calls;
