pub mod demo;
pub mod sim;

#[cfg(test)]
mod test;
