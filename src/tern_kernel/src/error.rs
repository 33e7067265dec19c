//! Result codes
use core::fmt;

/// The exhaustive set of result codes produced by the kernel.
///
/// Blocking operations report the reason their wait ended through this type;
/// API misuse and invariant violations are not represented here because they
/// halt the system instead of returning.
#[repr(i8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ResultCode {
    /// The operation completed normally.
    Success = 0,
    /// A non-blocking request could not complete without blocking.
    WouldBlock,
    /// The wait ended because the timeout elapsed.
    Timeout,
    /// The primitive was destroyed while the caller was waiting on it.
    Destroyed,
    /// The object is not in a state that permits the operation.
    Invalid,
    /// The one-slot destination is occupied.
    Busy,
}

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        #[must_use]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }
    };
}

define_suberror! {
    /// Error type for [`SemaphoreCb::wait`] and its timeout variant.
    ///
    /// [`SemaphoreCb::wait`]: crate::SemaphoreCb::wait
    pub enum DownError {
        WouldBlock,
        Timeout,
        Destroyed,
    }
}

define_suberror! {
    /// Error type for [`MutexCb::lock`].
    ///
    /// [`MutexCb::lock`]: crate::MutexCb::lock
    pub enum LockError {
        Destroyed,
    }
}

define_suberror! {
    /// Error type for [`WaitQueueCb::wait`].
    ///
    /// [`WaitQueueCb::wait`]: crate::WaitQueueCb::wait
    pub enum WaitError {
        Timeout,
        Destroyed,
    }
}

define_suberror! {
    /// Error type for the receiving half of [`MboxCb`] and [`MqueueCb`].
    ///
    /// [`MboxCb`]: crate::MboxCb
    /// [`MqueueCb`]: crate::MqueueCb
    pub enum PopError {
        Timeout,
        Destroyed,
    }
}

define_suberror! {
    /// Error type for [`MboxCb::post`].
    ///
    /// [`MboxCb::post`]: crate::MboxCb::post
    pub enum PostError {
        Busy,
    }
}
