fn main() {
    // The ONNX schema is vendored under proto/ and compiled with protox, so
    // building the crate never needs a system `protoc`.
    let file_descriptor_set = protox::compile(["proto/onnx.proto3"], ["proto/"])
        .expect("failed to compile proto/onnx.proto3");

    prost_build::Config::new()
        .compile_fds(file_descriptor_set)
        .expect("failed to generate prost bindings for the ONNX schema");

    println!("cargo:rerun-if-changed=proto/onnx.proto3");
    println!("cargo:rerun-if-changed=build.rs");
}
