/// Provide interoperability with C return values.
pub(crate) mod interop;

/// Provide a `select` method for [`bool`].
pub(crate) mod select;
