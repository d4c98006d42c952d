//! WebGL2 / GL ES 3.0 implementation of [`GpuDevice`] on top of `glow`.

use glam::{Mat4, Vec2};
use glow::HasContext;
use tracing::debug;

use crate::error::{Result, ViewerError};
use crate::renderer::{GpuDevice, QUAD_VERTICES};
use crate::texture::SplatTexture;

struct Uniforms<G: HasContext> {
    projection: Option<G::UniformLocation>,
    view: Option<G::UniformLocation>,
    focal: Option<G::UniformLocation>,
    viewport: Option<G::UniformLocation>,
    texture: Option<G::UniformLocation>,
}

struct Resources<G: HasContext> {
    program: G::Program,
    vertex_array: G::VertexArray,
    quad_buffer: G::Buffer,
    index_buffer: G::Buffer,
    texture: G::Texture,
    uniforms: Uniforms<G>,
}

pub struct GlDevice<G: HasContext> {
    gl: G,
    resources: Option<Resources<G>>,
    program: Option<G::Program>,
}

impl<G: HasContext> GlDevice<G> {
    pub fn new(gl: G) -> Self {
        Self {
            gl,
            resources: None,
            program: None,
        }
    }

    pub fn context(&self) -> &G {
        &self.gl
    }

    unsafe fn compile(&self, stage: &'static str, kind: u32, source: &str) -> Result<G::Shader> {
        let gl = &self.gl;
        let shader = gl
            .create_shader(kind)
            .map_err(|e| ViewerError::ShaderCompile { stage, log: e })?;
        gl.shader_source(shader, source);
        gl.compile_shader(shader);
        if !gl.get_shader_compile_status(shader) {
            let log = gl.get_shader_info_log(shader);
            gl.delete_shader(shader);
            return Err(ViewerError::ShaderCompile { stage, log });
        }
        Ok(shader)
    }
}

fn attrib(location: Option<u32>, name: &str) -> Result<u32> {
    location.ok_or_else(|| ViewerError::ShaderLink(format!("attribute `{}` not found", name)))
}

impl<G: HasContext> GpuDevice for GlDevice<G> {
    fn link_program(&mut self, vertex: &str, fragment: &str) -> Result<()> {
        unsafe {
            let vs = self.compile("vertex", glow::VERTEX_SHADER, vertex)?;
            let fs = match self.compile("fragment", glow::FRAGMENT_SHADER, fragment) {
                Ok(fs) => fs,
                Err(e) => {
                    self.gl.delete_shader(vs);
                    return Err(e);
                }
            };

            let gl = &self.gl;
            let program = gl.create_program().map_err(ViewerError::ShaderLink)?;
            gl.attach_shader(program, vs);
            gl.attach_shader(program, fs);
            gl.link_program(program);
            let linked = gl.get_program_link_status(program);

            gl.detach_shader(program, vs);
            gl.detach_shader(program, fs);
            gl.delete_shader(vs);
            gl.delete_shader(fs);

            if !linked {
                let log = gl.get_program_info_log(program);
                gl.delete_program(program);
                return Err(ViewerError::ShaderLink(log));
            }
            self.program = Some(program);
        }
        Ok(())
    }

    fn configure_pipeline(&mut self) -> Result<()> {
        let program = self
            .program
            .ok_or_else(|| ViewerError::ShaderLink("no linked program".to_string()))?;
        let gl = &self.gl;

        unsafe {
            gl.use_program(Some(program));
            gl.disable(glow::DEPTH_TEST);
            gl.enable(glow::BLEND);
            gl.blend_func(glow::ONE, glow::ONE_MINUS_SRC_ALPHA);
            gl.blend_equation(glow::FUNC_ADD);

            let uniforms = Uniforms {
                projection: gl.get_uniform_location(program, "projection"),
                view: gl.get_uniform_location(program, "view"),
                focal: gl.get_uniform_location(program, "focal"),
                viewport: gl.get_uniform_location(program, "viewport"),
                texture: gl.get_uniform_location(program, "u_texture"),
            };

            let vertex_array = gl.create_vertex_array().map_err(ViewerError::NoContext)?;
            gl.bind_vertex_array(Some(vertex_array));

            let quad_buffer = gl.create_buffer().map_err(ViewerError::NoContext)?;
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(quad_buffer));
            gl.buffer_data_u8_slice(
                glow::ARRAY_BUFFER,
                bytemuck::cast_slice(&QUAD_VERTICES),
                glow::STATIC_DRAW,
            );
            let a_position = attrib(gl.get_attrib_location(program, "position"), "position")?;
            gl.enable_vertex_attrib_array(a_position);
            gl.vertex_attrib_pointer_f32(a_position, 2, glow::FLOAT, false, 0, 0);

            let texture = gl.create_texture().map_err(ViewerError::NoContext)?;
            gl.active_texture(glow::TEXTURE0);
            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            for (param, value) in [
                (glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE),
                (glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE),
                (glow::TEXTURE_MIN_FILTER, glow::NEAREST),
                (glow::TEXTURE_MAG_FILTER, glow::NEAREST),
            ] {
                gl.tex_parameter_i32(glow::TEXTURE_2D, param, value as i32);
            }
            gl.uniform_1_i32(uniforms.texture.as_ref(), 0);

            let index_buffer = gl.create_buffer().map_err(ViewerError::NoContext)?;
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(index_buffer));
            let a_index = attrib(gl.get_attrib_location(program, "index"), "index")?;
            gl.enable_vertex_attrib_array(a_index);
            gl.vertex_attrib_pointer_i32(a_index, 1, glow::INT, 0, 0);
            gl.vertex_attrib_divisor(a_index, 1);

            self.resources = Some(Resources {
                program,
                vertex_array,
                quad_buffer,
                index_buffer,
                texture,
                uniforms,
            });
        }
        debug!("gl pipeline configured");
        Ok(())
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        unsafe { self.gl.viewport(0, 0, width as i32, height as i32) };
    }

    fn set_projection(&mut self, projection: &Mat4, focal: Vec2, viewport: Vec2) {
        let Some(res) = &self.resources else { return };
        let gl = &self.gl;
        unsafe {
            gl.uniform_matrix_4_f32_slice(
                res.uniforms.projection.as_ref(),
                false,
                &projection.to_cols_array(),
            );
            gl.uniform_2_f32(res.uniforms.focal.as_ref(), focal.x, focal.y);
            gl.uniform_2_f32(res.uniforms.viewport.as_ref(), viewport.x, viewport.y);
        }
    }

    fn set_view(&mut self, view: &Mat4) {
        let Some(res) = &self.resources else { return };
        unsafe {
            self.gl
                .uniform_matrix_4_f32_slice(res.uniforms.view.as_ref(), false, &view.to_cols_array());
        }
    }

    fn upload_texture(&mut self, texture: &SplatTexture) {
        let Some(res) = &self.resources else { return };
        let gl = &self.gl;
        unsafe {
            gl.bind_texture(glow::TEXTURE_2D, Some(res.texture));
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA32UI as i32,
                texture.width as i32,
                texture.height as i32,
                0,
                glow::RGBA_INTEGER,
                glow::UNSIGNED_INT,
                Some(texture.as_bytes()),
            );
            gl.active_texture(glow::TEXTURE0);
        }
    }

    fn upload_indices(&mut self, indices: &[u32]) {
        let Some(res) = &self.resources else { return };
        let gl = &self.gl;
        unsafe {
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(res.index_buffer));
            gl.buffer_data_u8_slice(
                glow::ARRAY_BUFFER,
                bytemuck::cast_slice(indices),
                glow::DYNAMIC_DRAW,
            );
        }
    }

    fn clear(&mut self, color: [f32; 4]) {
        unsafe {
            self.gl.clear_color(color[0], color[1], color[2], color[3]);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
        }
    }

    fn draw_instanced(&mut self, instances: u32) {
        let Some(res) = &self.resources else { return };
        unsafe {
            self.gl.bind_vertex_array(Some(res.vertex_array));
            self.gl
                .draw_arrays_instanced(glow::TRIANGLE_FAN, 0, 4, instances as i32);
        }
    }
}

impl<G: HasContext> Drop for GlDevice<G> {
    fn drop(&mut self) {
        unsafe {
            if let Some(res) = self.resources.take() {
                self.gl.delete_buffer(res.quad_buffer);
                self.gl.delete_buffer(res.index_buffer);
                self.gl.delete_texture(res.texture);
                self.gl.delete_vertex_array(res.vertex_array);
                self.gl.delete_program(res.program);
            } else if let Some(program) = self.program.take() {
                self.gl.delete_program(program);
            }
        }
    }
}
