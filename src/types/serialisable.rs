/// Types implementing BeanstalkSerialisable can be sent over the Beanstalk
/// TCP connection in the server -> client direction.
pub trait BeanstalkSerialisable {
    /// Converts the value in question to a Beanstalk response.
    fn serialise_beanstalk(&self) -> Vec<u8>;
}
