use std::future::Future;

use crate::{error::Error, UserResult};

/// A virtual user. One call runs one scenario iteration.
///
/// An executor never calls the same user concurrently, so implementors
/// may keep per-user state in `&mut self` without synchronization.
pub trait User: Send + 'static {
    fn call(&mut self) -> impl Future<Output = UserResult> + Send;
}

/// Builds the user with the given 1-based ordinal.
pub trait UserBuilder: Send + Sync + 'static {
    type Output: User;

    fn build(&self, vu: usize) -> Result<Self::Output, Error>;
}

impl<F, U> UserBuilder for F
where
    F: Fn(usize) -> U + Send + Sync + 'static,
    U: User,
{
    type Output = U;

    fn build(&self, vu: usize) -> Result<Self::Output, Error> {
        Ok(self(vu))
    }
}
