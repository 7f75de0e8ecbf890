//! Connections which are checked out of a connection pool.

use crate::backend::Channel;
use crate::connection::Connection;
use crate::pool::Pool;

use std::sync::Arc;

/// A [Connection] which is released back to its pool when dropped.
///
/// Releasing on drop means a checkout cannot leak, whichever way the
/// request using it ends. Handles deref to the connection itself.
pub struct Handle<Chan: Channel> {
    pool: Arc<Pool<Chan>>,
    conn: Connection<Chan>,
}

impl<Chan: Channel> Handle<Chan> {
    pub(crate) fn new(pool: Arc<Pool<Chan>>, conn: Connection<Chan>) -> Self {
        Self { pool, conn }
    }

    /// The pool this connection was checked out of.
    pub fn pool(&self) -> &Arc<Pool<Chan>> {
        &self.pool
    }
}

impl<Chan: Channel> std::ops::Deref for Handle<Chan> {
    type Target = Connection<Chan>;
    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<Chan: Channel> Drop for Handle<Chan> {
    fn drop(&mut self) {
        self.pool.release(&self.conn);
    }
}
