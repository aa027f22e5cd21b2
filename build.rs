// Build script to compile the demo's GLSL shaders to SPIR-V
//
// The blobs land under assets/shaders/, where the demo looks them up through
// the assets root. Without glslc the demo still runs and only clears.

use std::fs;
use std::path::Path;
use std::process::Command;

const SHADERS: [(&str, &str); 2] = [
    ("shaders/quad.vert", "assets/shaders/quad.vert.spv"),
    ("shaders/quad.frag", "assets/shaders/quad.frag.spv"),
];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    if let Err(e) = fs::create_dir_all("assets/shaders") {
        println!("cargo:warning=Could not create assets/shaders: {}", e);
        return;
    }
    for (input, output) in SHADERS {
        compile_shader(input, output);
    }
}

fn compile_shader(input: &str, output: &str) {
    let result = Command::new("glslc")
        .arg(Path::new(input))
        .arg("-o")
        .arg(Path::new(output))
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            println!("cargo:warning=Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), {} not compiled", e, input);
            println!("cargo:warning=Install the Vulkan SDK or run: glslc {} -o {}", input, output);
        }
    }
}
