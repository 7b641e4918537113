/// Docker module runs every sandboxed process in a throwaway container
/// driven through the docker CLI.
pub mod sandbox;
