//! GPU Video Presenter
//!
//! wgpu surface renderer with two paths: three-plane YUV textures converted
//! by the fragment shader, and a plain RGBA blit for CPU-converted frames.
//! Plane textures are recreated when the frame dimensions change and
//! sub-uploaded in place otherwise.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use wgpu::util::DeviceExt;
use winit::window::Window;

use super::shaders::{RGBA_SHADER, YUV_SHADER};
use crate::media::{RgbaVideoFrame, Yuv420VideoFrame};

/// Quad vertex: NDC position and texture coordinate.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 2],
    tex_coord: [f32; 2],
}

/// Two triangles covering the viewport; texture space is Y-flipped
/// relative to NDC.
const QUAD_VERTICES: &[Vertex] = &[
    Vertex { position: [-1.0, -1.0], tex_coord: [0.0, 1.0] },
    Vertex { position: [1.0, -1.0], tex_coord: [1.0, 1.0] },
    Vertex { position: [-1.0, 1.0], tex_coord: [0.0, 0.0] },
    Vertex { position: [-1.0, 1.0], tex_coord: [0.0, 0.0] },
    Vertex { position: [1.0, -1.0], tex_coord: [1.0, 1.0] },
    Vertex { position: [1.0, 1.0], tex_coord: [1.0, 0.0] },
];

/// Checks once whether any GPU adapter is reachable.
pub fn gpu_available() -> bool {
    static GPU_OK: once_cell::sync::OnceCell<bool> = once_cell::sync::OnceCell::new();
    *GPU_OK.get_or_init(|| {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .is_ok()
    })
}

pub struct VideoRenderer {
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,

    yuv_pipeline: wgpu::RenderPipeline,
    yuv_bind_group_layout: wgpu::BindGroupLayout,
    rgba_pipeline: wgpu::RenderPipeline,
    rgba_bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    quad: wgpu::Buffer,

    y_texture: Option<wgpu::Texture>,
    u_texture: Option<wgpu::Texture>,
    v_texture: Option<wgpu::Texture>,
    yuv_bind_group: Option<wgpu::BindGroup>,
    rgba_texture: Option<wgpu::Texture>,
    rgba_bind_group: Option<wgpu::BindGroup>,
    video_size: (u32, u32),
}

impl VideoRenderer {
    pub async fn new(window: Arc<Window>) -> Result<Self> {
        let size = window.inner_size();

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let surface = instance
            .create_surface(window.clone())
            .context("Failed to create surface")?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .context("Failed to find GPU adapter")?;

        let adapter_info = adapter.get_info();
        info!("GPU: {} (backend: {:?})", adapter_info.name, adapter_info.backend);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default())
            .await
            .context("Failed to create device")?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .unwrap_or(surface_caps.formats[0]);

        // Lowest-latency present mode the surface offers.
        let present_mode = if surface_caps.present_modes.contains(&wgpu::PresentMode::Immediate) {
            wgpu::PresentMode::Immediate
        } else if surface_caps.present_modes.contains(&wgpu::PresentMode::Mailbox) {
            wgpu::PresentMode::Mailbox
        } else {
            wgpu::PresentMode::Fifo
        };

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 1,
        };
        surface.configure(&device, &config);

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Video Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });

        let quad = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Video Quad"),
            contents: bytemuck::cast_slice(QUAD_VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let vertex_layout = wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2],
        };

        let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };
        let sampler_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        };

        let yuv_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("YUV Bind Group Layout"),
                entries: &[
                    texture_entry(0),
                    texture_entry(1),
                    texture_entry(2),
                    sampler_entry(3),
                ],
            });

        let rgba_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("RGBA Bind Group Layout"),
                entries: &[texture_entry(0), sampler_entry(1)],
            });

        let make_pipeline = |label: &str, shader_src: &str, layout: &wgpu::BindGroupLayout| {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(shader_src.into()),
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[layout],
                immediate_size: 0,
            });
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    buffers: &[vertex_layout.clone()],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: surface_format,
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview_mask: None,
                cache: None,
            })
        };

        let yuv_pipeline = make_pipeline("YUV Pipeline", YUV_SHADER, &yuv_bind_group_layout);
        let rgba_pipeline = make_pipeline("RGBA Pipeline", RGBA_SHADER, &rgba_bind_group_layout);

        Ok(Self {
            surface,
            device,
            queue,
            config,
            yuv_pipeline,
            yuv_bind_group_layout,
            rgba_pipeline,
            rgba_bind_group_layout,
            sampler,
            quad,
            y_texture: None,
            u_texture: None,
            v_texture: None,
            yuv_bind_group: None,
            rgba_texture: None,
            rgba_bind_group: None,
            video_size: (0, 0),
        })
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.config.width = width;
        self.config.height = height;
        self.surface.configure(&self.device, &self.config);
    }

    fn plane_texture(&self, label: &str, width: u32, height: u32) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    fn upload_plane(&self, texture: &wgpu::Texture, data: &[u8], stride: u32, width: u32, height: u32) {
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(stride),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Upload one YUV frame, reallocating the plane textures only when the
    /// frame dimensions change.
    pub fn update_video(&mut self, frame: &Yuv420VideoFrame) {
        let uv_width = frame.width / 2;
        let uv_height = frame.height.div_ceil(2);

        if self.video_size != (frame.width, frame.height) || self.yuv_bind_group.is_none() {
            self.video_size = (frame.width, frame.height);

            let y = self.plane_texture("Y Plane", frame.width, frame.height);
            let u = self.plane_texture("U Plane", uv_width, uv_height);
            let v = self.plane_texture("V Plane", uv_width, uv_height);

            let views = [
                y.create_view(&wgpu::TextureViewDescriptor::default()),
                u.create_view(&wgpu::TextureViewDescriptor::default()),
                v.create_view(&wgpu::TextureViewDescriptor::default()),
            ];
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("YUV Bind Group"),
                layout: &self.yuv_bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&views[0]),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&views[1]),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(&views[2]),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: wgpu::BindingResource::Sampler(&self.sampler),
                    },
                ],
            });

            self.y_texture = Some(y);
            self.u_texture = Some(u);
            self.v_texture = Some(v);
            self.yuv_bind_group = Some(bind_group);
            self.rgba_bind_group = None;

            info!(
                "YUV plane textures created: {}x{} (chroma {}x{})",
                frame.width, frame.height, uv_width, uv_height
            );
        }

        if let Some(texture) = &self.y_texture {
            self.upload_plane(texture, &frame.y_plane, frame.y_stride, frame.width, frame.height);
        }
        if let Some(texture) = &self.u_texture {
            self.upload_plane(texture, &frame.u_plane, frame.uv_stride, uv_width, uv_height);
        }
        if let Some(texture) = &self.v_texture {
            self.upload_plane(texture, &frame.v_plane, frame.uv_stride, uv_width, uv_height);
        }
    }

    /// Upload a CPU-converted RGBA frame.
    pub fn update_rgba(&mut self, frame: &RgbaVideoFrame) {
        if self.video_size != (frame.width, frame.height) || self.rgba_bind_group.is_none() {
            self.video_size = (frame.width, frame.height);

            let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("RGBA Frame"),
                size: wgpu::Extent3d {
                    width: frame.width,
                    height: frame.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8UnormSrgb,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("RGBA Bind Group"),
                layout: &self.rgba_bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&self.sampler),
                    },
                ],
            });

            self.rgba_texture = Some(texture);
            self.rgba_bind_group = Some(bind_group);
            self.yuv_bind_group = None;
        }

        if let Some(texture) = &self.rgba_texture {
            self.upload_plane4(texture, &frame.buffer, frame.width * 4, frame.width, frame.height);
        }
    }

    fn upload_plane4(&self, texture: &wgpu::Texture, data: &[u8], stride: u32, width: u32, height: u32) {
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(stride),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Draw whichever frame kind was uploaded last.
    pub fn render(&mut self) {
        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                self.surface.configure(&self.device, &self.config);
                return;
            }
            Err(err) => {
                warn!("surface error: {err:?}");
                return;
            }
        };

        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Video Encoder"),
            });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Video Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            if let Some(bind_group) = &self.yuv_bind_group {
                pass.set_pipeline(&self.yuv_pipeline);
                pass.set_bind_group(0, bind_group, &[]);
                pass.set_vertex_buffer(0, self.quad.slice(..));
                pass.draw(0..QUAD_VERTICES.len() as u32, 0..1);
            } else if let Some(bind_group) = &self.rgba_bind_group {
                pass.set_pipeline(&self.rgba_pipeline);
                pass.set_bind_group(0, bind_group, &[]);
                pass.set_vertex_buffer(0, self.quad.slice(..));
                pass.draw(0..QUAD_VERTICES.len() as u32, 0..1);
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();
    }

    /// Release GPU resources ahead of drop ordering concerns.
    pub fn destroy(&mut self) {
        self.yuv_bind_group = None;
        self.rgba_bind_group = None;
        self.y_texture = None;
        self.u_texture = None;
        self.v_texture = None;
        self.rgba_texture = None;
    }
}
