// 摄像头视频流服务
//
// 摄像头池、帧源、目标检测、多客户端推流与 HTTP 接口。

pub mod auth;
pub mod camera;
pub mod config;
pub mod detection;
pub mod http;
pub mod streaming;
