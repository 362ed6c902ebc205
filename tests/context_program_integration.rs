//! Integration tests for context lifecycle, program compilation and images
//!
//! These tests require a Vulkan-capable GPU and a GLSL compiler and are
//! marked #[ignore] by default.
//! Run with: cargo test -- --ignored
//!
//! # Test Coverage
//!
//! 1. **Lifecycle** - version checks, re-init after destroy, diagnostics
//! 2. **Compilation** - errors, defines, files, reload, SPIR-V cache
//! 3. **Uniforms** - push-constant members set by name
//! 4. **Images** - creation, binding, kernel access and readback

use hlx_compute::{BufferUsage, ComputeContext, ComputeError, ContextConfig, ImageFormat};
use std::io::Write;

// =============================================================================
// TEST UTILITIES
// =============================================================================

fn context() -> ComputeContext {
    ComputeContext::init(1, 2).expect("Vulkan 1.2 device required")
}

/// Writes 1 to data[0], or 3 (BAR) when FOO is defined
const DEFINE_SWITCH: &str = r#"
#version 450
layout(local_size_x = 1) in;
layout(set = 0, binding = 0) buffer Data { uint data[]; };
void main() {
#ifdef FOO
    data[0] = BAR;
#else
    data[0] = 1u;
#endif
}
"#;

const SCALE_BY_UNIFORM: &str = r#"
#version 450
layout(local_size_x = 64) in;
layout(set = 0, binding = 0) buffer Data { float data[]; };
layout(push_constant) uniform Params {
    float scale;
    uint count;
    vec4 offset;
} params;
void main() {
    uint i = gl_GlobalInvocationID.x;
    if (i < params.count) {
        data[i] = float(i) * params.scale + params.offset.y;
    }
}
"#;

const IMAGE_INVERT: &str = r#"
#version 450
layout(local_size_x = 8, local_size_y = 8) in;
layout(set = 1, binding = 0, r32f) uniform image2D img;
void main() {
    ivec2 p = ivec2(gl_GlobalInvocationID.xy);
    if (all(lessThan(p, imageSize(img)))) {
        vec4 v = imageLoad(img, p);
        imageStore(img, p, vec4(1.0 - v.x));
    }
}
"#;

fn run_define_switch(ctx: &mut ComputeContext, program: hlx_compute::Program) -> u32 {
    ctx.set_program(program).unwrap();
    let buffer = ctx.create_buffer_zeroed(4).unwrap();
    ctx.bind_buffer(&buffer, 0).unwrap();
    ctx.dispatch(1, 1, 1).unwrap();
    ctx.read_buffer_as::<u32>(&buffer, 1).unwrap()[0]
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[test]
#[ignore] // Requires GPU
fn test_version_boundaries() {
    let ctx = context();
    let (major, minor) = ctx.api_version();

    assert!(ctx.check_version(major, minor), "exact match must pass");
    assert!(ctx.check_version(1, 0));
    assert!(!ctx.check_version(major, minor + 1));
    assert!(!ctx.check_version(major + 1, 0));

    println!("✓ Device '{}' reports Vulkan {}.{}", ctx.device_name(), major, minor);
}

#[test]
#[ignore] // Requires GPU
fn test_reinit_after_destroy() {
    let first = context();
    let name = first.device_name();
    first.destroy();

    let second = ComputeContext::init(1, 2).unwrap();
    assert_eq!(second.device_name(), name);
    drop(second);

    let third = ComputeContext::init(1, 2).unwrap();
    third.destroy();

    println!("✓ Three sequential contexts on '{}'", name);
}

#[test]
#[ignore] // Requires GPU
fn test_unsatisfiable_version_fails() {
    let err = ComputeContext::init(99, 0).unwrap_err();
    assert!(matches!(
        err,
        ComputeError::InitializationFailed(_) | ComputeError::NoSuitableDevice(99, 0)
    ));
}

#[test]
#[ignore] // Requires GPU
fn test_limits_are_sane() {
    let ctx = context();
    let limits = ctx.limits();
    assert!(limits.max_group_count.iter().all(|&n| n >= 65535));
    assert!(limits.max_group_size[0] >= 128);
    assert!(limits.max_invocations_per_group >= 128);
}

#[test]
#[ignore] // Requires GPU
fn test_diagnostics_are_per_context() {
    let mut a = context();
    let b = context();

    assert!(a.create_buffer(0, None, BufferUsage::Dynamic).is_err());
    assert!(a.last_error().is_some());
    assert!(b.last_error().is_none());

    // Success never clears the last error
    let _buffer = a.create_buffer_zeroed(4).unwrap();
    assert!(a.last_error().unwrap().contains("Buffer size"));
}

#[test]
#[ignore] // Requires GPU
fn test_handles_rejected_by_other_context() {
    let mut a = context();
    let mut b = context();

    let buffer = a.create_buffer_zeroed(64).unwrap();
    let image = a.create_image_2d(4, 4, ImageFormat::R32F, None).unwrap();
    let program = a.compile(DEFINE_SWITCH).unwrap();

    assert!(matches!(b.bind_buffer(&buffer, 0), Err(ComputeError::InvalidArgument(_))));
    assert!(b.last_error().unwrap().contains("different context"));
    assert!(matches!(
        b.bind_image(&image, 0, ImageFormat::R32F),
        Err(ComputeError::InvalidArgument(_))
    ));
    assert!(matches!(b.set_program(program.clone()), Err(ComputeError::InvalidArgument(_))));
    assert!(b.program().is_none());

    assert!(b.write_buffer(&buffer, 0, &[1u8; 4]).is_err());
    assert!(b.read_buffer(&buffer, 4).is_err());
    let mut dest = [0u8; 4];
    assert!(b.read_buffer_async(&buffer, 0, &mut dest).is_err());
    assert!(b.map_buffer(&buffer, hlx_compute::MapAccess::Read).is_err());
    assert!(b.read_image(&image).is_err());
    assert!(a.last_error().is_none());

    // The owning context still accepts them
    assert_eq!(run_define_switch(&mut a, program), 1);
}

// =============================================================================
// COMPILATION
// =============================================================================

#[test]
#[ignore] // Requires GPU
fn test_compile_error_captured_verbatim() {
    let mut ctx = context();
    let err = ctx
        .compile("#version 450\nlayout(local_size_x = 1) in;\nvoid main() { undefined_fn(); }\n")
        .unwrap_err();

    match err {
        ComputeError::Compilation(log) => assert!(log.contains("undefined_fn")),
        other => panic!("expected compilation error, got {:?}", other),
    }
    assert!(ctx.last_error().unwrap().contains("undefined_fn"));
}

#[test]
#[ignore] // Requires GPU
fn test_defines_change_behaviour() {
    let mut ctx = context();

    let plain = ctx.compile(DEFINE_SWITCH).unwrap();
    assert_eq!(run_define_switch(&mut ctx, plain), 1);

    let defined = ctx.compile_with_defines(DEFINE_SWITCH, &["FOO", "BAR 3"]).unwrap();
    assert_eq!(run_define_switch(&mut ctx, defined), 3);

    println!("✓ Injected defines reach the first use site");
}

#[test]
#[ignore] // Requires GPU
fn test_identical_source_hits_cache() {
    let mut ctx = context();
    ctx.compile(DEFINE_SWITCH).unwrap();
    ctx.compile(DEFINE_SWITCH).unwrap();
    assert_eq!(ctx.cached_programs(), 1);

    ctx.compile_with_defines(DEFINE_SWITCH, &["FOO", "BAR 7"]).unwrap();
    assert_eq!(ctx.cached_programs(), 2);
}

#[test]
#[ignore] // Requires GPU
fn test_compile_file_and_missing_file() {
    let mut ctx = context();

    let err = ctx.compile_file("/nonexistent/kernel.comp").unwrap_err();
    assert!(matches!(err, ComputeError::Io { action: "open", .. }));

    let mut file = tempfile::Builder::new().suffix(".comp").tempfile().unwrap();
    file.write_all(DEFINE_SWITCH.as_bytes()).unwrap();
    let program = ctx.compile_file(file.path()).unwrap();
    assert_eq!(run_define_switch(&mut ctx, program), 1);
}

#[test]
#[ignore] // Requires GPU
fn test_reload_keeps_program_on_failure() {
    let mut ctx = context();
    let mut file = tempfile::Builder::new().suffix(".comp").tempfile().unwrap();
    file.write_all(DEFINE_SWITCH.as_bytes()).unwrap();
    file.flush().unwrap();

    ctx.reload(file.path()).unwrap();
    let before = ctx.program().unwrap().pipeline();

    // Broken edit: reload fails, current program untouched
    std::fs::write(file.path(), "#version 450\nthis is not glsl\n").unwrap();
    assert!(ctx.reload(file.path()).is_err());
    assert_eq!(ctx.program().unwrap().pipeline(), before);

    // Fixed edit: reload replaces the program
    let fixed = DEFINE_SWITCH.replace("data[0] = 1u;", "data[0] = 42u;");
    std::fs::write(file.path(), fixed).unwrap();
    ctx.reload(file.path()).unwrap();

    let buffer = ctx.create_buffer_zeroed(4).unwrap();
    ctx.bind_buffer(&buffer, 0).unwrap();
    ctx.dispatch(1, 1, 1).unwrap();
    assert_eq!(ctx.read_buffer_as::<u32>(&buffer, 1).unwrap()[0], 42);

    println!("✓ Hot reload swaps programs only on success");
}

// =============================================================================
// UNIFORMS
// =============================================================================

#[test]
#[ignore] // Requires GPU
fn test_uniforms_by_name() {
    let mut ctx = context();

    assert!(matches!(
        ctx.set_uniform_float("scale", 1.0),
        Err(ComputeError::Misuse(_))
    ));

    let program = ctx.compile(SCALE_BY_UNIFORM).unwrap();
    assert!(program.interface().push_member("offset").is_some());
    ctx.set_program(program).unwrap();

    ctx.set_uniform_float("scale", 2.0).unwrap();
    ctx.set_uniform_uint("count", 100).unwrap();
    ctx.set_uniform_vec4("offset", [0.0, 0.5, 0.0, 0.0]).unwrap();

    // Unknown names are ignored, wrong sizes are not
    ctx.set_uniform_float("does_not_exist", 1.0).unwrap();
    assert!(matches!(
        ctx.set_uniform_vec2("scale", [1.0, 2.0]),
        Err(ComputeError::InvalidArgument(_))
    ));

    let buffer = ctx.create_buffer_zeroed(128 * 4).unwrap();
    ctx.bind_buffer(&buffer, 0).unwrap();
    ctx.dispatch_1d(2).unwrap();

    let values: Vec<f32> = ctx.read_buffer_as(&buffer, 128).unwrap();
    for (i, &v) in values.iter().enumerate() {
        let expected = if i < 100 { i as f32 * 2.0 + 0.5 } else { 0.0 };
        assert_eq!(v, expected, "element {}", i);
    }
}

// =============================================================================
// IMAGES
// =============================================================================

#[test]
#[ignore] // Requires GPU
fn test_image_round_trip_through_kernel() {
    let mut ctx = context();
    let (w, h) = (16u32, 8u32);
    let texels: Vec<f32> = (0..w * h).map(|i| i as f32 / 128.0).collect();

    let image = ctx
        .create_image_2d(w, h, ImageFormat::R32F, Some(bytemuck::cast_slice(&texels)))
        .unwrap();
    assert_eq!(image.byte_len(), (w * h * 4) as u64);

    let initial = ctx.read_image(&image).unwrap();
    assert_eq!(initial, bytemuck::cast_slice::<f32, u8>(&texels));

    let program = ctx.compile(IMAGE_INVERT).unwrap();
    ctx.set_program(program).unwrap();
    ctx.bind_image(&image, 0, ImageFormat::R32F).unwrap();
    ctx.dispatch_2d(w / 8, h / 8).unwrap();

    let bytes = ctx.read_image(&image).unwrap();
    let inverted: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    for (got, original) in inverted.iter().zip(&texels) {
        assert!((got - (1.0 - original)).abs() < 1e-6);
    }

    println!("✓ {}x{} r32f image inverted in place", w, h);
}

#[test]
#[ignore] // Requires GPU
fn test_image_arguments_checked() {
    let mut ctx = context();

    assert!(ctx.create_image_2d(0, 4, ImageFormat::R32F, None).is_err());
    assert!(ctx
        .create_image_2d(4, 4, ImageFormat::Rgba32F, Some(&[0u8; 16]))
        .is_err());

    let image = ctx.create_image_2d(4, 4, ImageFormat::Rgba32F, None).unwrap();
    assert!(ctx.read_image(&image).unwrap().iter().all(|&b| b == 0));

    assert!(matches!(
        ctx.bind_image(&image, 0, ImageFormat::R32F),
        Err(ComputeError::InvalidArgument(_))
    ));
    ctx.bind_image(&image, 0, ImageFormat::Rgba32F).unwrap();
}

#[test]
#[ignore] // Requires GPU
fn test_image_3d_write_and_read() {
    let mut ctx = context();
    let image = ctx.create_image_3d(4, 4, 4, ImageFormat::R32UI, None).unwrap();
    assert_eq!(image.depth(), 4);

    let data: Vec<u32> = (0..64).collect();
    ctx.write_image(&image, bytemuck::cast_slice(&data)).unwrap();
    let back = ctx.read_image(&image).unwrap();
    assert_eq!(back, bytemuck::cast_slice::<u32, u8>(&data));
}

#[test]
#[ignore] // Requires GPU
fn test_config_disables_auto_barrier() {
    let config = ContextConfig {
        auto_barrier: false,
        ..ContextConfig::default()
    };
    let ctx = ComputeContext::init_with_config(1, 2, config).unwrap();
    assert!(!ctx.auto_barrier());
}
