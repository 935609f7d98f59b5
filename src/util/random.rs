use rand::distributions::Alphanumeric;
use rand::Rng;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// expectations for mocked static methods are global state - tests mocking
///  [Random] hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random {
    /// A one-time token the controller hands to a launched subprocess so the
    ///  rendezvous pairs up the right two endpoints, even with several
    ///  concurrent sessions on one host.
    fn rendezvous_token() -> String;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn rendezvous_token() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_token_shape() {
        let token = RngRandom::rendezvous_token();
        assert_eq!(token.len(), 16);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_tokens_differ() {
        assert_ne!(RngRandom::rendezvous_token(), RngRandom::rendezvous_token());
    }
}
