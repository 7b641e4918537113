/// Native module runs sandboxed processes directly on the host,
/// without Docker, using process groups and rlimits instead.
pub mod sandbox;
